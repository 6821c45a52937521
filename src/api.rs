//! HTTP JSON endpoints for room operations.

use axum::{
    extract::{FromRequest, Path, Request, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;

use crate::abuse::{self, AbuseConfig};
use crate::auth::{self, AuthConfig, Owner};
use crate::error::RoomError;
use crate::protocol::{
    CleanupReport, CreateRoomRequest, CreateRoomResponse, DeleteRoomResponse, JoinRoomRequest,
    JoinRoomResponse, RoomView, SubmitWordRequest, SubmitWordResponse, WordEntry,
};
use crate::state::AppState;
use crate::ws;

/// Error body returned by every endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub msg: String,
}

impl RoomError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RoomError::RoomNotFound | RoomError::ParticipantNotFound => StatusCode::NOT_FOUND,
            RoomError::Expired => StatusCode::GONE,
            RoomError::Finished
            | RoomError::Full
            | RoomError::AlreadyVoted
            | RoomError::NotStarted
            | RoomError::InvalidTransition(_) => StatusCode::CONFLICT,
            RoomError::Forbidden(_) => StatusCode::FORBIDDEN,
            RoomError::InvalidInput(_) | RoomError::InvalidWord(_) => StatusCode::BAD_REQUEST,
            RoomError::AllocationExhausted { .. }
            | RoomError::Contention { .. }
            | RoomError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            RoomError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RoomError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(code = self.code(), error = %self, "Request failed");
        }

        let body = Json(ErrorBody {
            code: self.code().to_string(),
            msg: self.to_string(),
        });
        if self.is_retryable() {
            (status, [(header::RETRY_AFTER, "1")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

type ApiResult<T> = Result<Json<T>, RoomError>;

/// JSON body extractor that rejects with the regular error body
pub struct RoomJson<T>(pub T);

impl<S, T> FromRequest<S> for RoomJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = RoomError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| RoomError::InvalidInput(rejection.body_text()))?;
        Ok(Self(value))
    }
}

/// POST /api/rooms
pub async fn create_room(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    RoomJson(req): RoomJson<CreateRoomRequest>,
) -> Result<(StatusCode, Json<CreateRoomResponse>), RoomError> {
    let created = state.create_room(&owner, req).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /api/rooms/{code}
pub async fn get_room(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> ApiResult<RoomView> {
    Ok(Json(state.get_room(&code).await?))
}

#[derive(Debug, Deserialize)]
pub struct JoinBody {
    #[serde(default)]
    pub participant_name: Option<String>,
    pub identity_token: String,
}

/// POST /api/rooms/{code}/join
pub async fn join_room(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    RoomJson(body): RoomJson<JoinBody>,
) -> ApiResult<JoinRoomResponse> {
    let req = JoinRoomRequest {
        room_code: code,
        participant_name: body.participant_name,
        identity_token: body.identity_token,
    };
    Ok(Json(state.join_room(req).await?))
}

/// POST /api/rooms/{code}/activate
pub async fn activate_room(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Owner(owner): Owner,
) -> ApiResult<RoomView> {
    Ok(Json(state.activate_room(&code, &owner).await?))
}

/// POST /api/rooms/{code}/finish
pub async fn finish_room(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Owner(owner): Owner,
) -> ApiResult<RoomView> {
    Ok(Json(state.finish_room(&code, &owner).await?))
}

/// DELETE /api/rooms/{code}
pub async fn delete_room(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    Owner(owner): Owner,
) -> ApiResult<DeleteRoomResponse> {
    Ok(Json(state.delete_room(&code, &owner).await?))
}

/// GET /api/rooms/{code}/words
pub async fn list_words(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> ApiResult<Vec<WordEntry>> {
    Ok(Json(state.list_words(&code).await?))
}

/// POST /api/words
pub async fn submit_word(
    State(state): State<Arc<AppState>>,
    RoomJson(req): RoomJson<SubmitWordRequest>,
) -> ApiResult<SubmitWordResponse> {
    Ok(Json(state.submit_word(req).await?))
}

/// POST /api/admin/cleanup
///
/// Expires and purges every room past its TTL right away.
pub async fn manual_cleanup(State(state): State<Arc<AppState>>) -> Json<CleanupReport> {
    Json(state.manual_cleanup().await)
}

/// Build the application router
pub fn router(
    state: Arc<AppState>,
    auth_config: Arc<AuthConfig>,
    abuse_config: Arc<AbuseConfig>,
) -> Router {
    // Rate limited by the identity in the request body
    let participant_routes = Router::new()
        .route("/api/rooms/{code}/join", post(join_room))
        .route("/api/words", post(submit_word))
        .layer(middleware::from_fn_with_state(
            abuse_config,
            abuse::rate_limit_middleware,
        ));

    let admin_routes = Router::new()
        .route("/api/admin/cleanup", post(manual_cleanup))
        .layer(middleware::from_fn_with_state(
            auth_config,
            auth::admin_auth_middleware,
        ));

    Router::new()
        .route("/api/rooms", post(create_room))
        .route("/api/rooms/{code}", get(get_room).delete(delete_room))
        .route("/api/rooms/{code}/activate", post(activate_room))
        .route("/api/rooms/{code}/finish", post(finish_room))
        .route("/api/rooms/{code}/words", get(list_words))
        .route("/ws", get(ws::ws_handler))
        .merge(participant_routes)
        .merge(admin_routes)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::room::{RoomEvent, TransitionError};
    use crate::types::RoomState;
    use std::time::Duration;

    #[test]
    fn test_status_codes() {
        assert_eq!(RoomError::RoomNotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(RoomError::Expired.status_code(), StatusCode::GONE);
        assert_eq!(RoomError::AlreadyVoted.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            RoomError::InvalidWord("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RoomError::InvalidTransition(TransitionError {
                from: RoomState::Finished,
                event: RoomEvent::Activate,
            })
            .status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_retryable_errors_carry_retry_after() {
        let response = RoomError::Timeout(Duration::from_secs(5)).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");

        let response = RoomError::Full.into_response();
        assert!(response.headers().get(header::RETRY_AFTER).is_none());
    }
}
