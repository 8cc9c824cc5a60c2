use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use chrono::Utc;
use uuid::Uuid;

use rapport_types::api::{Claims, ReactionResponse, ToggleReactionRequest};
use rapport_types::events::GatewayEvent;

use crate::auth::AppState;
use crate::error::ApiResult;
use crate::{blocking, fan_out};

/// Toggle the caller's emoji on a message: first call adds, second removes.
pub async fn toggle_reaction(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ToggleReactionRequest>,
) -> ApiResult<impl IntoResponse> {
    let actor = claims.sub;
    let emoji = req.emoji.clone();
    let (reactions, action, conversation_id) = blocking(&state, move |db| {
        db.toggle_reaction(message_id, actor, &emoji, Utc::now())
    })
    .await?;

    fan_out(
        &state,
        conversation_id,
        &[],
        GatewayEvent::ReactionUpdate {
            conversation_id,
            message_id,
            user_id: actor,
            emoji: req.emoji,
            action,
            reactions: reactions.clone(),
        },
    )
    .await;

    Ok(Json(ReactionResponse {
        message_id,
        action,
        reactions,
    }))
}
