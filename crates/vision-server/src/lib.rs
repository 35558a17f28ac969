pub mod cleanup;
pub mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use vision_api::AppStateInner;
use vision_db::Database;
use vision_gateway::{Dispatcher, JwtVerifier, connection};

use crate::config::Config;

/// Wire the dispatcher, REST routes and `/socket` upgrade together.
pub fn build_app(config: &Config, db: Arc<Database>) -> (Router, Dispatcher) {
    let verifier = Arc::new(JwtVerifier::new(&config.jwt_secret));
    let dispatcher = Dispatcher::new(db, verifier, config.gateway.clone());

    let api = vision_api::router(Arc::new(AppStateInner {
        dispatcher: dispatcher.clone(),
        restore_window: config.restore_window,
    }));

    let ws_route = Router::new()
        .route("/socket", get(ws_upgrade))
        .with_state(dispatcher.clone());

    let app = Router::new()
        .merge(api)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    (app, dispatcher)
}

async fn ws_upgrade(State(dispatcher): State<Dispatcher>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_connection(socket, dispatcher))
}
