//! Registration, login and session validation.

use crate::{
    entity::UserInfo,
    error::{ChatError, Result},
    server::AppState,
    store::{Session, Store},
};
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, info};

pub const SESSION_COOKIE: &str = "session";

/// Identity attached to a request by [`require_auth`].
#[derive(Debug, Clone)]
pub struct AuthUser(pub UserInfo);

pub struct Auth {
    store: Store,
    session_ttl: Duration,
    hash_cost: u32,
}

impl Auth {
    pub fn new(store: Store, session_ttl: Duration) -> Self {
        Self {
            store,
            session_ttl,
            hash_cost: bcrypt::DEFAULT_COST,
        }
    }

    #[cfg(test)]
    pub fn with_hash_cost(mut self, cost: u32) -> Self {
        self.hash_cost = cost;
        self
    }

    pub async fn register(&self, username: &str, password: &str) -> Result<(UserInfo, Session)> {
        validate_username(username)?;
        validate_password(password)?;

        let password = password.to_string();
        let cost = self.hash_cost;
        let hash = tokio::task::spawn_blocking(move || bcrypt::hash(password, cost)).await??;

        let user = self.store.create_user(username, &hash).await?;
        let session = self.store.create_session(user.id, self.session_ttl).await?;
        info!(user_id = %user.id, username, "user registered");

        Ok((user.into(), session))
    }

    pub async fn login(&self, username: &str, password: &str) -> Result<(UserInfo, Session)> {
        let user = match self.store.get_user_by_username(username).await {
            Ok(user) => user,
            Err(ChatError::NotFound(_)) => return Err(invalid_credentials()),
            Err(e) => return Err(e),
        };

        let password = password.to_string();
        let hash = user.password_hash.clone();
        let valid = tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash)).await??;
        if !valid {
            return Err(invalid_credentials());
        }

        let session = self.store.create_session(user.id, self.session_ttl).await?;
        info!(user_id = %user.id, username, "user logged in");

        Ok((user.into(), session))
    }

    /// Resolve a session token to its user. Expired sessions are deleted.
    pub async fn authenticate(&self, token: &str) -> Result<UserInfo> {
        let session = self
            .store
            .find_session(token)
            .await?
            .ok_or_else(|| ChatError::Unauthorized("unknown session".into()))?;

        if session.expires_at <= Utc::now() {
            debug!(user_id = %session.user_id, "session expired");
            self.store.delete_session(token).await?;
            return Err(ChatError::Unauthorized("session expired".into()));
        }

        match self.store.get_user_by_id(session.user_id).await {
            Ok(user) => Ok(user.into()),
            Err(ChatError::NotFound(_)) => Err(ChatError::Unauthorized("unknown session".into())),
            Err(e) => Err(e),
        }
    }

    pub async fn logout(&self, token: &str) -> Result<()> {
        self.store.delete_session(token).await
    }
}

fn invalid_credentials() -> ChatError {
    ChatError::Unauthorized("invalid username or password".into())
}

pub fn validate_username(username: &str) -> Result<()> {
    let len = username.chars().count();
    if !(3..=32).contains(&len) {
        return Err(ChatError::validation(
            "username must be between 3 and 32 characters",
        ));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(ChatError::validation(
            "username may only contain letters, digits and underscores",
        ));
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<()> {
    let len = password.chars().count();
    if !(8..=128).contains(&len) {
        return Err(ChatError::validation(
            "password must be between 8 and 128 characters",
        ));
    }
    Ok(())
}

/// Session token from `Authorization: Bearer <token>` or the session cookie.
pub fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|h| h.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == SESSION_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

pub fn session_cookie(session: &Session) -> String {
    let max_age = (session.expires_at - session.created_at).num_seconds().max(0);
    format!(
        "{}={}; HttpOnly; SameSite=Strict; Path=/; Max-Age={}",
        SESSION_COOKIE, session.token, max_age
    )
}

/// Rejects requests without a valid session before they reach a handler.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response> {
    let token = extract_token(req.headers())
        .ok_or_else(|| ChatError::Unauthorized("no session token".into()))?;
    let user = state.auth.authenticate(&token).await?;

    debug!(user = %user, path = %req.uri().path(), "authenticated request");
    req.extensions_mut().insert(AuthUser(user));

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;
    use axum::http::HeaderValue;

    fn test_auth(store: Store) -> Auth {
        Auth::new(store, Duration::from_secs(3600)).with_hash_cost(4)
    }

    #[tokio::test]
    async fn register_then_login_then_authenticate() {
        let (store, _dir) = test_store().await;
        let auth = test_auth(store.clone());

        let (user, session) = auth.register("alice", "correct horse").await.unwrap();
        let stored = store.get_user_by_username("alice").await.unwrap();
        assert_ne!(stored.password_hash, "correct horse");

        let me = auth.authenticate(&session.token).await.unwrap();
        assert_eq!(me.id, user.id);

        let (again, second) = auth.login("alice", "correct horse").await.unwrap();
        assert_eq!(again.id, user.id);
        assert_ne!(second.token, session.token);
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user_look_the_same() {
        let (store, _dir) = test_store().await;
        let auth = test_auth(store);
        auth.register("alice", "correct horse").await.unwrap();

        let wrong = auth.login("alice", "battery staple").await.unwrap_err();
        let unknown = auth.login("mallory", "battery staple").await.unwrap_err();
        assert!(matches!(wrong, ChatError::Unauthorized(_)));
        assert_eq!(wrong.to_string(), unknown.to_string());
    }

    #[tokio::test]
    async fn duplicate_registration_conflicts() {
        let (store, _dir) = test_store().await;
        let auth = test_auth(store);
        auth.register("alice", "correct horse").await.unwrap();

        let err = auth.register("alice", "another pass").await.unwrap_err();
        assert!(matches!(err, ChatError::Conflict(_)));
    }

    #[tokio::test]
    async fn expired_or_revoked_sessions_are_rejected() {
        let (store, _dir) = test_store().await;
        let auth = Auth::new(store.clone(), Duration::ZERO).with_hash_cost(4);
        let (_, session) = auth.register("alice", "correct horse").await.unwrap();

        let err = auth.authenticate(&session.token).await.unwrap_err();
        assert!(matches!(err, ChatError::Unauthorized(_)));
        assert!(store.find_session(&session.token).await.unwrap().is_none());

        let auth = test_auth(store);
        let (_, session) = auth.login("alice", "correct horse").await.unwrap();
        auth.logout(&session.token).await.unwrap();
        assert!(auth.authenticate(&session.token).await.is_err());
    }

    #[test]
    fn credential_rules() {
        assert!(validate_username("al").is_err());
        assert!(validate_username("alice smith").is_err());
        assert!(validate_username("alice_01").is_ok());
        assert!(validate_password("short").is_err());
        assert!(validate_password("long enough").is_ok());
    }

    #[test]
    fn token_from_bearer_header_or_cookie() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_token(&headers), None);

        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; session=abc123"),
        );
        assert_eq!(extract_token(&headers).as_deref(), Some("abc123"));

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer xyz789"),
        );
        assert_eq!(extract_token(&headers).as_deref(), Some("xyz789"));
    }
}
