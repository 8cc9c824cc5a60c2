use std::time::Duration;

use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use rapport_types::api::Claims;
use rapport_types::events::GatewayEvent;

use crate::auth::AppState;
use crate::error::ApiResult;
use crate::{blocking, fan_out};

/// Markers older than this are reclaimed by the sweep.
pub const SWEEP_MAX_AGE_SECS: i64 = 60;

pub async fn start_typing(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let user_id = claims.sub;
    let marker = blocking(&state, move |db| db.set_typing(conversation_id, user_id, Utc::now())).await?;

    fan_out(
        &state,
        conversation_id,
        &[],
        GatewayEvent::TypingStart {
            conversation_id,
            user: marker.user.clone(),
        },
    )
    .await;
    Ok(Json(marker))
}

pub async fn stop_typing(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let user_id = claims.sub;
    let removed = blocking(&state, move |db| db.clear_typing(conversation_id, user_id)).await?;

    if removed {
        fan_out(
            &state,
            conversation_id,
            &[],
            GatewayEvent::TypingStop {
                conversation_id,
                user_id,
            },
        )
        .await;
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Who else is typing right now.
pub async fn list_typing(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    let requester = claims.sub;
    let markers =
        blocking(&state, move |db| db.list_typing(conversation_id, requester, Utc::now())).await?;
    Ok(Json(markers))
}

/// Background task that deletes stale typing markers. Readers already filter
/// by freshness; this only keeps the table small.
pub async fn run_sweep_loop(state: AppState, interval_secs: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
    let max_age = chrono::Duration::seconds(SWEEP_MAX_AGE_SECS);

    loop {
        interval.tick().await;

        match blocking(&state, move |db| db.sweep_typing(Utc::now(), max_age)).await {
            Ok(0) => {}
            Ok(count) => debug!("Typing sweep: removed {} stale markers", count),
            Err(e) => warn!("Typing sweep error: {}", e),
        }
    }
}
