//! REST client for the web application's PostgREST-style API

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{MatchStore, RecordHandle, StoreError, TournamentRecord};

/// Low-level client authenticated with the service key
#[derive(Clone)]
pub struct RestClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    /// Get the REST API URL for a table
    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// GET expecting at most one row
    pub async fn get_one<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>, StoreError> {
        let response = self
            .authed(self.client.get(self.rest_url(table)).query(query))
            .header("Accept", "application/vnd.pgrst.object+json")
            .send()
            .await
            .map_err(StoreError::Request)?;

        if response.status() == reqwest::StatusCode::NOT_ACCEPTABLE {
            // No rows found
            return Ok(None);
        }

        let response = Self::check(response).await?;
        response.json().await.map(Some).map_err(StoreError::Parse)
    }

    /// POST (insert) returning the created row
    pub async fn insert<T: Serialize, R: DeserializeOwned>(
        &self,
        table: &str,
        data: &T,
    ) -> Result<R, StoreError> {
        let response = self
            .authed(self.client.post(self.rest_url(table)))
            .header("Prefer", "return=representation")
            .json(data)
            .send()
            .await
            .map_err(StoreError::Request)?;

        let response = Self::check(response).await?;

        // PostgREST returns an array, get first element
        let rows: Vec<R> = response.json().await.map_err(StoreError::Parse)?;
        rows.into_iter().next().ok_or(StoreError::NoRowReturned)
    }

    /// PATCH rows matching `query`
    pub async fn update<T: Serialize>(
        &self,
        table: &str,
        query: &[(&str, String)],
        data: &T,
    ) -> Result<(), StoreError> {
        let response = self
            .authed(self.client.patch(self.rest_url(table)).query(query))
            .json(data)
            .send()
            .await
            .map_err(StoreError::Request)?;

        Self::check(response).await?;
        Ok(())
    }

    /// Insert or merge on conflict
    pub async fn upsert<T: Serialize>(
        &self,
        table: &str,
        data: &T,
        on_conflict: &str,
    ) -> Result<(), StoreError> {
        let response = self
            .authed(
                self.client
                    .post(self.rest_url(table))
                    .query(&[("on_conflict", on_conflict)]),
            )
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(data)
            .send()
            .await
            .map_err(StoreError::Request)?;

        Self::check(response).await?;
        Ok(())
    }
}

/// PostgREST equality filter. The value is percent-encoded by `query`.
fn eq(value: impl std::fmt::Display) -> String {
    format!("eq.{value}")
}

/// Row of the `games` table
#[derive(Debug, Clone, Deserialize)]
struct GameRow {
    id: i64,
}

#[derive(Debug, Clone, Serialize)]
struct NewGame<'a> {
    session_id: &'a str,
    player1: &'a str,
    player2: &'a str,
    score_player1: u32,
    score_player2: u32,
}

#[derive(Debug, Clone, Serialize)]
struct ScoreUpdate {
    score_player1: u32,
    score_player2: u32,
}

#[derive(Debug, Clone, Serialize)]
struct GameResult<'a> {
    winner: Option<&'a str>,
    end_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
struct UserRow {
    #[allow(dead_code)]
    username: String,
}

/// `MatchStore` backed by the web application's REST API
#[derive(Clone)]
pub struct RestStore {
    client: RestClient,
}

impl RestStore {
    pub fn new(client: RestClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MatchStore for RestStore {
    async fn create_or_get_match_record(
        &self,
        session_id: &str,
        player1: &str,
        player2: &str,
    ) -> Result<RecordHandle, StoreError> {
        let query = [("session_id", eq(session_id)), ("select", "id".to_string())];
        if let Some(row) = self.client.get_one::<GameRow>("games", &query).await? {
            return Ok(RecordHandle(row.id));
        }

        let game = NewGame {
            session_id,
            player1,
            player2,
            score_player1: 0,
            score_player2: 0,
        };
        let row: GameRow = self.client.insert("games", &game).await?;
        Ok(RecordHandle(row.id))
    }

    async fn update_score(
        &self,
        record: RecordHandle,
        player1: u32,
        player2: u32,
    ) -> Result<(), StoreError> {
        let query = [("id", eq(record.0))];
        let update = ScoreUpdate {
            score_player1: player1,
            score_player2: player2,
        };
        self.client.update("games", &query, &update).await
    }

    async fn finalize_match(
        &self,
        record: RecordHandle,
        winner: Option<&str>,
        ended_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let query = [("id", eq(record.0))];
        let result = GameResult {
            winner,
            end_time: ended_at,
        };
        self.client.update("games", &query, &result).await
    }

    async fn user_exists(&self, username: &str) -> Result<bool, StoreError> {
        let query = [("username", eq(username)), ("select", "username".to_string())];
        let user: Option<UserRow> = self.client.get_one("users", &query).await?;
        Ok(user.is_some())
    }

    async fn save_tournament(&self, record: &TournamentRecord) -> Result<(), StoreError> {
        self.client.upsert("tournaments", record, "tournament_id").await
    }
}
