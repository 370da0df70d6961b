//! Token verification for the web application's HS256 tokens

use axum::{
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::game::PlayerId;
use crate::util::time::unix_secs;

type HmacSha256 = Hmac<Sha256>;

/// Claims of a web application token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Player the token was issued to
    pub username: PlayerId,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
    /// Issued at (Unix timestamp)
    #[serde(default)]
    pub iat: u64,
    /// Subject, if the issuer sets one
    #[serde(default)]
    pub sub: Option<String>,
}

/// Verify a JWT token and extract claims
pub fn verify_jwt(token: &str, secret: &str) -> Result<JwtClaims, AuthError> {
    let mut parts = token.split('.');
    let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::InvalidToken);
    };

    // Verify signature (HMAC-SHA256)
    let message = format!("{}.{}", header_b64, payload_b64);

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| AuthError::InvalidToken)?;
    mac.update(message.as_bytes());

    let provided_signature = URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| AuthError::InvalidToken)?;
    mac.verify_slice(&provided_signature)
        .map_err(|_| AuthError::InvalidToken)?;

    // Decode payload
    let payload_json = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| AuthError::InvalidToken)?;

    let claims: JwtClaims =
        serde_json::from_slice(&payload_json).map_err(|_| AuthError::InvalidToken)?;

    if claims.exp < unix_secs() {
        return Err(AuthError::TokenExpired);
    }

    Ok(claims)
}

/// Extract JWT from Authorization header
pub fn extract_bearer_token(auth_header: &str) -> Option<&str> {
    auth_header.strip_prefix("Bearer ")
}

/// Verify the caller's token, taken from `?token=` or the Authorization header.
///
/// Without a configured secret every caller is trusted and `None` is returned.
pub fn authenticate(
    secret: Option<&str>,
    query_token: Option<&str>,
    headers: &HeaderMap,
) -> Result<Option<JwtClaims>, AuthError> {
    let Some(secret) = secret else {
        return Ok(None);
    };

    let token = match query_token {
        Some(token) => token,
        None => {
            let auth_header = headers
                .get(header::AUTHORIZATION)
                .and_then(|h| h.to_str().ok())
                .ok_or(AuthError::MissingHeader)?;
            extract_bearer_token(auth_header).ok_or(AuthError::InvalidFormat)?
        }
    };

    verify_jwt(token, secret).map(Some)
}

/// Check that a claimed username belongs to the verified token, if any
pub fn ensure_identity(claims: Option<&JwtClaims>, username: &str) -> Result<(), AuthError> {
    match claims {
        Some(claims) if claims.username != username => Err(AuthError::IdentityMismatch {
            claimed: username.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Authentication error types
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing authorization header")]
    MissingHeader,

    #[error("Invalid authorization header format")]
    InvalidFormat,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Token does not belong to {claimed}")]
    IdentityMismatch { claimed: PlayerId },
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match &self {
            AuthError::MissingHeader => StatusCode::UNAUTHORIZED,
            AuthError::InvalidFormat => StatusCode::BAD_REQUEST,
            AuthError::InvalidToken => StatusCode::UNAUTHORIZED,
            AuthError::TokenExpired => StatusCode::UNAUTHORIZED,
            AuthError::IdentityMismatch { .. } => StatusCode::FORBIDDEN,
        };

        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use tokio_test::{assert_err, assert_ok};

    const SECRET: &str = "test-secret";

    fn sign(claims: &serde_json::Value, secret: &str) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{header}.{payload}").as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{header}.{payload}.{signature}")
    }

    fn token_for(username: &str, exp: u64) -> String {
        sign(&serde_json::json!({ "username": username, "exp": exp }), SECRET)
    }

    #[test]
    fn accepts_valid_token() {
        let claims = verify_jwt(&token_for("alice", unix_secs() + 60), SECRET).unwrap();
        assert_eq!(claims.username, "alice");
    }

    #[test]
    fn rejects_wrong_secret_and_garbage() {
        let token = token_for("alice", unix_secs() + 60);
        assert!(matches!(
            verify_jwt(&token, "other-secret"),
            Err(AuthError::InvalidToken)
        ));
        assert!(matches!(verify_jwt("a.b", SECRET), Err(AuthError::InvalidToken)));
        assert!(matches!(
            verify_jwt(&format!("{token}.extra"), SECRET),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn rejects_expired_token() {
        let token = token_for("alice", unix_secs().saturating_sub(10));
        assert!(matches!(verify_jwt(&token, SECRET), Err(AuthError::TokenExpired)));
    }

    #[test]
    fn without_secret_everyone_is_trusted() {
        let claims = assert_ok!(authenticate(None, None, &HeaderMap::new()));
        assert!(claims.is_none());
        assert_ok!(ensure_identity(None, "anyone"));
    }

    #[test]
    fn token_from_query_or_bearer_header() {
        let token = token_for("bob", unix_secs() + 60);

        let from_query = authenticate(Some(SECRET), Some(&token), &HeaderMap::new()).unwrap();
        assert_eq!(from_query.unwrap().username, "bob");

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        let from_header = authenticate(Some(SECRET), None, &headers).unwrap();
        assert_eq!(from_header.unwrap().username, "bob");

        assert!(matches!(
            authenticate(Some(SECRET), None, &HeaderMap::new()),
            Err(AuthError::MissingHeader)
        ));
    }

    #[test]
    fn claimed_username_must_match_token() {
        let claims = assert_ok!(verify_jwt(&token_for("bob", unix_secs() + 60), SECRET));
        assert_ok!(ensure_identity(Some(&claims), "bob"));
        let err = assert_err!(ensure_identity(Some(&claims), "alice"));
        assert!(matches!(err, AuthError::IdentityMismatch { .. }));
    }
}
