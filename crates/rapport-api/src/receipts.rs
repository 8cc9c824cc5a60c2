use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use chrono::Utc;
use uuid::Uuid;

use rapport_types::api::{Claims, MarkReadRequest, MarkReadResponse, UnreadResponse};
use rapport_types::events::GatewayEvent;

use crate::auth::AppState;
use crate::error::ApiResult;
use crate::{blocking, fan_out};

/// Mark the listed messages read, or every unread one when no list is given.
pub async fn mark_read(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<MarkReadRequest>,
) -> ApiResult<impl IntoResponse> {
    let user_id = claims.sub;
    let conversation_id = req.conversation_id;
    let read_at = Utc::now();

    let marked = blocking(&state, move |db| {
        db.mark_read(conversation_id, user_id, req.message_ids.as_deref(), read_at)
    })
    .await?;

    if !marked.is_empty() {
        fan_out(
            &state,
            conversation_id,
            &[],
            GatewayEvent::ReadReceipts {
                conversation_id,
                user_id,
                message_ids: marked.clone(),
                read_at,
            },
        )
        .await;
    }

    Ok(Json(MarkReadResponse { marked, read_at }))
}

pub async fn read_by(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let actor = claims.sub;
    let receipts = blocking(&state, move |db| db.read_by(message_id, actor)).await?;
    Ok(Json(receipts))
}

pub async fn unread_count(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let user_id = claims.sub;
    let unread_count = blocking(&state, move |db| db.unread_count(conversation_id, user_id)).await?;
    Ok(Json(UnreadResponse {
        conversation_id,
        unread_count,
    }))
}
