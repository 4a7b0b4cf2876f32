use serde::{Deserialize, Serialize};

use crate::web::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "assistant")]
    Assistant,
    #[serde(rename = "system")]
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// Inbound body of `POST /chat`: an ordered conversation where the last
/// element is the new user turn.
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: Vec<Message>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub response: String,
}

/// Splits a conversation into prior history and the newest turn's content.
/// The backend is never called for an empty conversation.
pub fn split_history(messages: &[Message]) -> Result<(&[Message], &str), GatewayError> {
    match messages.split_last() {
        Some((last, history)) => Ok((history, &last.content)),
        None => Err(GatewayError::InvalidRequest(
            "message list must not be empty".to_string(),
        )),
    }
}
