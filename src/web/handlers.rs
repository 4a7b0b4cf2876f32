use actix_web::{web, HttpResponse, Responder};
use bytes::Bytes;
use futures::StreamExt;
use log::{error, info};
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::Config;
use crate::model::{GenerationBackend, TokenEvent};
use crate::web::error::GatewayError;
use crate::web::models::{split_history, ChatRequest, ChatResponse};

const DIAGNOSTIC_PROMPT: &str = "Hello world, who are you?";

// Root endpoint: fires one fixed prompt at the backend and logs the outcome.
// Smoke test only; reports 200 whatever the backend says.
pub async fn index(
    backend: web::Data<dyn GenerationBackend>,
    config: web::Data<Config>,
) -> impl Responder {
    info!("Diagnostic prompt: {}", DIAGNOSTIC_PROMPT);
    match backend
        .generate(&[], DIAGNOSTIC_PROMPT, config.max_new_tokens)
        .await
    {
        Ok(response) => info!("Diagnostic response: {}", response),
        Err(e) => error!("Diagnostic generation failed: {}", e),
    }
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

// Health check endpoint
pub async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

fn validate(req: &ChatRequest, config: &Config) -> Result<(), GatewayError> {
    if req.message.len() > config.max_history_messages {
        return Err(GatewayError::InvalidRequest(format!(
            "message list exceeds {} entries",
            config.max_history_messages
        )));
    }
    Ok(())
}

// Blocking chat endpoint: returns the whole completion as one JSON payload.
pub async fn chat(
    backend: web::Data<dyn GenerationBackend>,
    config: web::Data<Config>,
    req: web::Json<ChatRequest>,
) -> Result<HttpResponse, GatewayError> {
    validate(&req, &config)?;
    let (history, last_message) = split_history(&req.message)?;
    info!("Chat request with {} history messages", history.len());

    let response = backend
        .generate(history, last_message, config.max_new_tokens)
        .await
        .map_err(|e| {
            error!("Model error: {}", e);
            GatewayError::Backend(e)
        })?;

    Ok(HttpResponse::Ok().json(ChatResponse { response }))
}

// Streaming chat endpoint: forwards fragments as plain-text chunks in
// production order. Errors after the first fragment abort the body.
pub async fn chat_stream(
    backend: web::Data<dyn GenerationBackend>,
    config: web::Data<Config>,
    req: web::Json<ChatRequest>,
) -> Result<HttpResponse, GatewayError> {
    validate(&req, &config)?;
    let (history, last_message) = split_history(&req.message)?;
    info!("Streaming chat request with {} history messages", history.len());

    let receiver = backend
        .generate_stream(history, last_message, config.max_new_tokens)
        .await
        .map_err(|e| {
            error!("Model error: {}", e);
            GatewayError::Backend(e)
        })?;

    let body = ReceiverStream::new(receiver).filter_map(|event| {
        futures::future::ready(match event {
            TokenEvent::Fragment(text) => {
                Some(Ok::<Bytes, actix_web::Error>(Bytes::from(text)))
            }
            TokenEvent::Done => None,
            TokenEvent::Error(reason) => {
                error!("Stream terminated by backend error: {}", reason);
                Some(Err(actix_web::error::ErrorInternalServerError(reason)))
            }
        })
    });

    Ok(HttpResponse::Ok()
        .content_type("text/plain; charset=utf-8")
        .streaming(body))
}
