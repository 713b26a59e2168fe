use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_cookies::CookieManagerLayer;
use tower_http::trace::TraceLayer;

use crate::http::*;

/// Build the Axum router with all endpoints
pub fn build_router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // accounts & sessions
        .route("/api/register", post(register_handler))
        .route("/api/auth/login", post(login_handler))
        .route("/api/auth/logout", post(logout_handler))
        .route("/api/auth/session", get(session_handler))
        // workspaces
        .route(
            "/api/workspaces",
            get(list_workspaces_handler).post(create_workspace_handler),
        )
        .route("/api/workspaces/facebook-pages", post(attach_page_handler))
        .route("/api/workspaces/:id", get(workspace_overview_handler))
        .route(
            "/api/workspaces/:id/conversations",
            get(list_conversations_handler),
        )
        // conversations
        .route(
            "/api/conversations/:id",
            get(get_conversation_handler).patch(update_conversation_handler),
        )
        .route(
            "/api/conversations/:id/messages",
            post(send_message_handler),
        )
        // facebook page connection
        .route(
            "/api/auth/facebook-pages/connect",
            get(facebook_connect_handler),
        )
        .route(
            "/api/auth/facebook-pages/callback",
            get(facebook_callback_handler),
        )
        // messenger webhook
        .route(
            "/api/webhooks/facebook",
            get(webhook_verify_handler).post(webhook_receive_handler),
        )
        .layer(CookieManagerLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
