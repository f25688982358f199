use std::convert::Infallible;

use axum::Json;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::error;

use marketcache_market::now_millis;

use crate::error::ApiError;

pub const MESSAGE_ID_HEADER: &str = "x-message-id";
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    pub message_id: String,
    pub timestamp: i64,
    pub datetime: String,
    pub code: u16,
    pub message: String,
}

/// Envelope de toda resposta HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub meta: Meta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Envelope {
    pub fn new(message_id: String, status: StatusCode, data: Option<Value>) -> Self {
        let now = now_millis();
        let datetime = chrono::DateTime::from_timestamp_millis(now)
            .map(|dt| dt.format(DATETIME_FORMAT).to_string())
            .unwrap_or_default();

        Self {
            meta: Meta {
                message_id,
                timestamp: now,
                datetime,
                code: status.as_u16(),
                message: status.canonical_reason().unwrap_or_default().to_string(),
            },
            data,
        }
    }
}

/// ID da mensagem: header `X-Message-Id` da requisição ou um UUID novo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn generate() -> Self {
        MessageId(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn respond(self, status: StatusCode, data: Option<Value>) -> Response {
        (status, Json(Envelope::new(self.0, status, data))).into_response()
    }

    /// Converte o resultado de um handler no envelope de resposta.
    pub fn reply(self, result: Result<Value, ApiError>) -> Response {
        match result {
            Ok(data) => self.respond(StatusCode::OK, Some(data)),
            Err(e) => {
                let status = e.status();
                if status.is_server_error() {
                    error!("requisição {} falhou: {e}", self.0);
                }
                self.respond(status, Some(json!({ "error": e.to_string() })))
            }
        }
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for MessageId
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get(MESSAGE_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| MessageId(v.to_string()))
            .unwrap_or_else(MessageId::generate);
        Ok(id)
    }
}
