use axum::{
    extract::{Extension, Json, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    auth::{extract_token, session_cookie, AuthUser, SESSION_COOKIE},
    chat::ChatHistory,
    entity::UserInfo,
    error::Result,
    history,
    store::Session,
};

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub user: UserInfo,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

fn session_response(user: UserInfo, session: &Session) -> SessionResponse {
    SessionResponse {
        user,
        token: session.token.clone(),
        expires_at: session.expires_at,
    }
}

/// POST /api/user/register
pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<Credentials>,
) -> Result<impl IntoResponse> {
    let (user, session) = state.auth.register(&body.username, &body.password).await?;
    Ok((
        StatusCode::CREATED,
        [(header::SET_COOKIE, session_cookie(&session))],
        Json(session_response(user, &session)),
    ))
}

/// POST /api/user/login
pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<Credentials>,
) -> Result<impl IntoResponse> {
    let (user, session) = state.auth.login(&body.username, &body.password).await?;
    Ok((
        [(header::SET_COOKIE, session_cookie(&session))],
        Json(session_response(user, &session)),
    ))
}

/// POST /api/user/logout
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Result<impl IntoResponse> {
    if let Some(token) = extract_token(&headers) {
        state.auth.logout(&token).await?;
    }
    let expired = format!("{}=; HttpOnly; SameSite=Strict; Path=/; Max-Age=0", SESSION_COOKIE);
    Ok((StatusCode::NO_CONTENT, [(header::SET_COOKIE, expired)]))
}

/// GET /api/user/me
pub async fn me(Extension(AuthUser(user)): Extension<AuthUser>) -> Json<UserInfo> {
    Json(user)
}

/// GET /api/chat/get-messages/:username
pub async fn chat_messages(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(username): Path<String>,
) -> Result<Json<Vec<ChatHistory>>> {
    let chats = history::shared_with(&state.store, user.id, &username).await?;
    Ok(Json(chats))
}

/// GET /api/chat/chats
pub async fn chats(
    State(state): State<AppState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> Result<Json<Vec<ChatHistory>>> {
    Ok(Json(history::all_chats(&state.store, user.id).await?))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let registry = state.registry();
    Json(json!({
        "status": "ok",
        "online_users": registry.user_count(),
        "live_connections": registry.connection_count(),
    }))
}
