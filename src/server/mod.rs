use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    auth::{require_auth, Auth},
    config::Config,
    pipeline::{Pipeline, PipelineSettings},
    registry::ConnectionRegistry,
    store::Store,
};

mod http;
mod ws;

// -----------------------------------------------------------------------------
// Server State
// -----------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub auth: Arc<Auth>,
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(config: Config, store: Store) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let pipeline = Pipeline::new(
            store.clone(),
            registry,
            PipelineSettings::from(&config),
        );
        let auth = Auth::new(store.clone(), config.session_ttl);

        Self {
            config: Arc::new(config),
            store,
            auth: Arc::new(auth),
            pipeline: Arc::new(pipeline),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.pipeline.registry()
    }
}

// -----------------------------------------------------------------------------
// Router
// -----------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/user/me", get(http::me))
        .route("/api/user/logout", post(http::logout))
        .route("/api/chat/get-messages/:username", get(http::chat_messages))
        .route("/api/chat/chats", get(http::chats))
        .route("/ws", get(ws::ws_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/api/user/register", post(http::register))
        .route("/api/user/login", post(http::login))
        .route("/health", get(http::health))
        .merge(protected)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
