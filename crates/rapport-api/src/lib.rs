pub mod auth;
pub mod conversations;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod reactions;
pub mod receipts;
pub mod typing;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    middleware::from_fn_with_state,
    response::IntoResponse,
    routing::{get, patch, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use uuid::Uuid;

use rapport_db::{Database, StoreResult};
use rapport_gateway::connection;
use rapport_types::events::GatewayEvent;

use crate::auth::AppState;
use crate::error::{ApiError, ApiResult};

/// Full HTTP + WebSocket surface.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login));

    let protected_routes = Router::new()
        .route(
            "/conversations",
            get(conversations::list_conversations).post(conversations::create_conversation),
        )
        .route(
            "/conversations/{conversation_id}",
            get(conversations::get_conversation).patch(conversations::update_conversation),
        )
        .route(
            "/conversations/{conversation_id}/participants",
            post(conversations::add_participants),
        )
        .route(
            "/conversations/{conversation_id}/participants/{user_id}",
            patch(conversations::set_role).delete(conversations::remove_participant),
        )
        .route("/conversations/{conversation_id}/leave", post(conversations::leave_conversation))
        .route("/conversations/{conversation_id}/messages", get(messages::list_messages))
        .route("/conversations/{conversation_id}/unread", get(receipts::unread_count))
        .route(
            "/conversations/{conversation_id}/typing",
            get(typing::list_typing)
                .post(typing::start_typing)
                .delete(typing::stop_typing),
        )
        .route("/messages/send", post(messages::send_message))
        .route("/messages/mark-read", post(receipts::mark_read))
        .route(
            "/messages/{message_id}",
            get(messages::get_message)
                .patch(messages::edit_message)
                .delete(messages::delete_message),
        )
        .route("/messages/{message_id}/react", post(reactions::toggle_reaction))
        .route("/messages/{message_id}/read-by", get(receipts::read_by))
        .layer(from_fn_with_state(state.clone(), middleware::require_auth));

    let ws_route = Router::new().route("/gateway", get(ws_upgrade));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let dispatcher = state.dispatcher.clone();
    let secret = state.jwt_secret.clone();
    ws.on_upgrade(move |socket| connection::handle_connection(socket, dispatcher, secret))
}

/// Run a store call off the async runtime.
pub(crate) async fn blocking<F, T>(state: &AppState, f: F) -> ApiResult<T>
where
    F: FnOnce(&Database) -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    let state = state.clone();
    tokio::task::spawn_blocking(move || f(&state.db))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError::Internal(anyhow::anyhow!("blocking task failed: {}", e))
        })?
        .map_err(ApiError::from)
}

/// Push `event` to the sockets of every active participant, plus any `extra`
/// recipients (e.g. a member who was just removed). Never fails the caller.
pub(crate) async fn fan_out(
    state: &AppState,
    conversation_id: Uuid,
    extra: &[Uuid],
    event: GatewayEvent,
) {
    let recipients = match blocking(state, move |db| db.active_participant_ids(conversation_id)).await {
        Ok(mut ids) => {
            for id in extra {
                if !ids.contains(id) {
                    ids.push(*id);
                }
            }
            ids
        }
        Err(e) => {
            warn!("fan-out for {} skipped: {}", conversation_id, e);
            return;
        }
    };
    state.dispatcher.send_to_users(&recipients, event).await;
}
