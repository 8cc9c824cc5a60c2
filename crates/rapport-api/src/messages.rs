use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use rapport_db::messages::{NewMessage, Page};
use rapport_types::api::{Claims, EditMessageRequest, SendMessageRequest};
use rapport_types::events::GatewayEvent;
use rapport_types::models::Message;

use crate::auth::AppState;
use crate::error::ApiResult;
use crate::{blocking, fan_out};

#[derive(Debug, Default, Deserialize)]
pub struct MessageQuery {
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: u32,
    /// Cursor: id of the oldest message from the previous page.
    pub before: Option<Uuid>,
    #[serde(default)]
    pub include_deleted: bool,
}

pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let sender_id = claims.sub;
    let conversation_id = req.conversation_id;
    let new = NewMessage {
        conversation_id,
        sender_id,
        content: req.content,
        kind: req.message_type,
        reply_to: req.reply_to,
        attachments: req.attachments,
    };

    let (message, stopped_typing) = blocking(&state, move |db| {
        let message = db.append_message(new, Utc::now())?;
        // Sending ends the sender's typing indicator.
        let stopped = match db.clear_typing(conversation_id, sender_id) {
            Ok(stopped) => stopped,
            Err(e) => {
                warn!("clearing typing after send failed: {}", e);
                false
            }
        };
        Ok((message, stopped))
    })
    .await?;

    if stopped_typing {
        fan_out(
            &state,
            conversation_id,
            &[],
            GatewayEvent::TypingStop {
                conversation_id,
                user_id: sender_id,
            },
        )
        .await;
    }
    fan_out(&state, conversation_id, &[], GatewayEvent::MessageCreate(message.clone())).await;

    Ok((StatusCode::CREATED, Json(message)))
}

/// Page through history, then record read-on-view receipts for whatever the
/// caller was shown. Receipt failures never fail the listing.
pub async fn list_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let viewer = claims.sub;
    let page = Page {
        limit: query.limit,
        offset: query.offset,
        before: query.before,
        include_deleted: query.include_deleted,
    };

    let messages: Vec<Message> =
        blocking(&state, move |db| db.list_messages(conversation_id, viewer, &page)).await?;

    record_views(&state, conversation_id, viewer, messages.clone()).await;

    Ok(Json(messages))
}

async fn record_views(state: &AppState, conversation_id: Uuid, viewer: Uuid, shown: Vec<Message>) {
    let now = Utc::now();
    match blocking(state, move |db| db.record_views(viewer, &shown, now)).await {
        Ok(marked) if marked.is_empty() => {}
        Ok(marked) => {
            debug!("{} viewed {} unread messages in {}", viewer, marked.len(), conversation_id);
            fan_out(
                state,
                conversation_id,
                &[],
                GatewayEvent::ReadReceipts {
                    conversation_id,
                    user_id: viewer,
                    message_ids: marked,
                    read_at: now,
                },
            )
            .await;
        }
        Err(e) => warn!("read-on-view for {} in {} failed: {}", viewer, conversation_id, e),
    }
}

pub async fn get_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let actor = claims.sub;
    let message = blocking(&state, move |db| db.get_message(message_id, actor)).await?;
    Ok(Json(message))
}

pub async fn edit_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<EditMessageRequest>,
) -> ApiResult<impl IntoResponse> {
    let actor = claims.sub;
    let message = blocking(&state, move |db| {
        db.edit_message(message_id, actor, req.content, Utc::now())
    })
    .await?;

    fan_out(
        &state,
        message.conversation_id,
        &[],
        GatewayEvent::MessageUpdate(message.clone()),
    )
    .await;
    Ok(Json(message))
}

pub async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let actor = claims.sub;
    let message = blocking(&state, move |db| db.delete_message(message_id, actor, Utc::now())).await?;

    fan_out(
        &state,
        message.conversation_id,
        &[],
        GatewayEvent::MessageDelete {
            conversation_id: message.conversation_id,
            message_id,
            deleted_by: message.deleted_by.unwrap_or(actor),
        },
    )
    .await;
    Ok(Json(message))
}
