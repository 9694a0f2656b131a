use crate::error::AppError;
use crate::models::{MessageId, SessionId, UserId};
use crate::state::AppState;
use actix_web::{get, post, web, HttpResponse};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub sender_id: UserId,
    pub text: String,
}

/// HTTP counterpart of the WebSocket `message` event.
#[post("/v1/sessions/{session_id}/messages")]
pub async fn send_message(
    state: web::Data<AppState>,
    path: web::Path<SessionId>,
    body: web::Json<SendMessageRequest>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();
    let request = body.into_inner();
    if request.text.trim().is_empty() {
        return Err(AppError::BadRequest("message text is empty".into()));
    }

    let envelope = state
        .gateway
        .receive(session_id, request.sender_id, &request.text)
        .await?;

    Ok(HttpResponse::Created().json(envelope))
}

#[get("/v1/messages/{message_id}")]
pub async fn get_message(
    state: web::Data<AppState>,
    path: web::Path<MessageId>,
) -> Result<HttpResponse, AppError> {
    let message = state.gateway.fetch(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(message))
}
