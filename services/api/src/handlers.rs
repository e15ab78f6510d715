//! Axum Handlers for the REST API
//!
//! Read access to persisted chats and chat sharing. Writes to chats only happen
//! through actions on the WebSocket.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use parley_core::Identity;
use std::sync::Arc;
use tracing::{error, info};

use crate::{
    auth::identity_from_headers,
    models::{ChatResponse, ChatSummary, ErrorResponse, ShareResponse},
    state::AppState,
};

pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    NotFound(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::Unauthorized => {
                let message = "x-user-id header is required".to_string();
                (StatusCode::UNAUTHORIZED, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

fn require_identity(headers: &HeaderMap) -> Result<Identity, ApiError> {
    identity_from_headers(headers).ok_or(ApiError::Unauthorized)
}

fn chat_not_found(id: &str) -> ApiError {
    ApiError::NotFound(format!("Chat with id '{}' not found", id))
}

/// List the chats of the current user, most recent first.
#[utoipa::path(
    get,
    path = "/api/chats",
    responses(
        (status = 200, description = "List of chats", body = [ChatSummary]),
        (status = 401, description = "Missing identity", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("x-user-id" = String, Header, description = "The ID of the user")
    )
)]
pub async fn list_chats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ChatSummary>>, ApiError> {
    let owner = require_identity(&headers)?;
    let chats = state.gateway.list(&owner).await?;
    Ok(Json(chats.iter().map(ChatSummary::from).collect()))
}

/// Get a chat with its transcript and replayed presentation state.
#[utoipa::path(
    get,
    path = "/api/chats/{id}",
    responses(
        (status = 200, description = "Chat details", body = ChatResponse),
        (status = 401, description = "Missing identity", body = ErrorResponse),
        (status = 404, description = "Chat not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = String, Path, description = "Chat ID"),
        ("x-user-id" = String, Header, description = "The ID of the user")
    )
)]
pub async fn get_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = require_identity(&headers)?;
    let record = state
        .gateway
        .load(&owner, &id)
        .await?
        .ok_or_else(|| chat_not_found(&id))?;
    Ok((StatusCode::OK, Json(ChatResponse::from(record))))
}

/// Share a chat so that anyone with its share path can read it.
#[utoipa::path(
    post,
    path = "/api/chats/{id}/share",
    responses(
        (status = 200, description = "Chat shared", body = ShareResponse),
        (status = 401, description = "Missing identity", body = ErrorResponse),
        (status = 404, description = "Chat not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = String, Path, description = "Chat ID"),
        ("x-user-id" = String, Header, description = "The ID of the owner")
    )
)]
pub async fn share_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = require_identity(&headers)?;
    let record = state
        .gateway
        .share(&owner, &id)
        .await?
        .ok_or_else(|| chat_not_found(&id))?;
    let share_path = record
        .share_path
        .ok_or_else(|| ApiError::InternalServerError(anyhow::anyhow!("share path not set")))?;
    info!(chat_id = %id, user_id = %owner.user_id, "Chat shared");
    Ok((StatusCode::OK, Json(ShareResponse { id, share_path })))
}

/// Read a shared chat. No identity is required.
#[utoipa::path(
    get,
    path = "/api/share/{id}",
    responses(
        (status = 200, description = "Shared chat", body = ChatResponse),
        (status = 404, description = "Chat not found or not shared", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("id" = String, Path, description = "Chat ID")
    )
)]
pub async fn get_shared_chat(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state
        .gateway
        .shared(&id)
        .await?
        .ok_or_else(|| chat_not_found(&id))?;
    Ok((StatusCode::OK, Json(ChatResponse::from(record))))
}

pub async fn not_found() -> ApiError {
    ApiError::NotFound("No such page".to_string())
}
