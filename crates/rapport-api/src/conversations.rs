use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use rapport_types::api::{
    AddParticipantsRequest, Claims, ConversationResponse, ConversationSummary,
    CreateConversationRequest, ParticipantResponse, SetRoleRequest, UpdateConversationRequest,
};
use rapport_types::events::GatewayEvent;
use rapport_types::models::{Conversation, ConversationKind, Membership, Message, Profile};

use crate::auth::AppState;
use crate::error::{ApiError, ApiResult};
use crate::{blocking, fan_out};

fn conversation_response(
    (conversation, participants): (Conversation, Vec<(Membership, Profile)>),
) -> ConversationResponse {
    ConversationResponse {
        conversation,
        participants: participants
            .into_iter()
            .map(|(membership, profile)| ParticipantResponse { profile, membership })
            .collect(),
    }
}

/// Broadcast a membership change: the conversation update plus the system
/// message that documents it.
async fn announce(state: &AppState, conversation: Conversation, message: Message, extra: &[Uuid]) {
    let id = conversation.id;
    fan_out(state, id, extra, GatewayEvent::ConversationUpdate(conversation)).await;
    fan_out(state, id, extra, GatewayEvent::MessageCreate(message)).await;
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let rows = blocking(&state, move |db| db.list_conversations(claims.sub)).await?;
    let summaries: Vec<ConversationSummary> = rows
        .into_iter()
        .map(|(conversation, unread_count)| ConversationSummary {
            conversation,
            unread_count,
        })
        .collect();
    Ok(Json(summaries))
}

/// Direct conversations are get-or-create; groups are always new.
pub async fn create_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateConversationRequest>,
) -> ApiResult<impl IntoResponse> {
    let actor = claims.sub;
    let now = Utc::now();

    let (response, created) = match req.kind {
        ConversationKind::Direct => {
            let mut peers: Vec<Uuid> = req
                .participant_ids
                .iter()
                .copied()
                .filter(|id| *id != actor)
                .collect();
            peers.sort();
            peers.dedup();
            let &[peer] = peers.as_slice() else {
                return Err(ApiError::bad_request(
                    "a direct conversation needs exactly one other participant",
                ));
            };

            blocking(&state, move |db| {
                let (conversation, created) = db.create_or_get_direct(actor, peer, now)?;
                let full = db.get_conversation(conversation.id, actor)?;
                Ok((conversation_response(full), created))
            })
            .await?
        }
        ConversationKind::Group => {
            let ids = req.participant_ids;
            let name = req.name;
            let description = req.description;
            blocking(&state, move |db| {
                let conversation = db.create_group(actor, &ids, name, description, now)?;
                let full = db.get_conversation(conversation.id, actor)?;
                Ok((conversation_response(full), true))
            })
            .await?
        }
    };

    if created {
        info!(
            "{} created {:?} conversation {}",
            actor, response.conversation.kind, response.conversation.id
        );
        fan_out(
            &state,
            response.conversation.id,
            &[],
            GatewayEvent::ConversationUpdate(response.conversation.clone()),
        )
        .await;
    }

    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(response)))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let full = blocking(&state, move |db| db.get_conversation(conversation_id, claims.sub)).await?;
    Ok(Json(conversation_response(full)))
}

pub async fn update_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpdateConversationRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.is_empty() {
        return Err(ApiError::bad_request("nothing to update"));
    }

    let (conversation, renamed) = blocking(&state, move |db| {
        db.update_settings(conversation_id, claims.sub, &req, Utc::now())
    })
    .await?;

    fan_out(
        &state,
        conversation_id,
        &[],
        GatewayEvent::ConversationUpdate(conversation.clone()),
    )
    .await;
    if let Some(message) = renamed {
        fan_out(&state, conversation_id, &[], GatewayEvent::MessageCreate(message)).await;
    }

    Ok(Json(conversation))
}

pub async fn add_participants(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AddParticipantsRequest>,
) -> ApiResult<impl IntoResponse> {
    let actor = claims.sub;
    let (conversation, message, full) = blocking(&state, move |db| {
        let (conversation, message) =
            db.add_participants(conversation_id, actor, &req.user_ids, Utc::now())?;
        let full = db.get_conversation(conversation_id, actor)?;
        Ok((conversation, message, full))
    })
    .await?;

    announce(&state, conversation, message, &[]).await;
    Ok(Json(conversation_response(full)))
}

pub async fn remove_participant(
    State(state): State<AppState>,
    Path((conversation_id, user_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let actor = claims.sub;
    let (conversation, message) = blocking(&state, move |db| {
        db.remove_participant(conversation_id, actor, user_id, Utc::now())
    })
    .await?;

    announce(&state, conversation, message, &[user_id]).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn leave_conversation(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let actor = claims.sub;
    let (conversation, message) =
        blocking(&state, move |db| db.leave_conversation(conversation_id, actor, Utc::now())).await?;

    announce(&state, conversation, message, &[actor]).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn set_role(
    State(state): State<AppState>,
    Path((conversation_id, user_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SetRoleRequest>,
) -> ApiResult<impl IntoResponse> {
    let actor = claims.sub;
    let membership =
        blocking(&state, move |db| db.set_role(conversation_id, actor, user_id, req.role)).await?;
    info!("{} set {} to {} in {}", actor, user_id, membership.role, conversation_id);
    Ok(Json(membership))
}
