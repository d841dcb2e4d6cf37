use crate::feedmux_logic::config::Config;
use anyhow::{Context, Result};
use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures_util::StreamExt;
use lib_feedmux::{FeedError, MultiplexerHandle, Request, Response, ResponseType};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

#[derive(Clone)]
pub struct AppState {
    mux: MultiplexerHandle,
    send_timeout: Duration,
}

pub async fn run(
    config: Config,
    mux: MultiplexerHandle,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let state = AppState {
        mux,
        send_timeout: config.send_timeout(),
    };
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port()));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    log::info!("Downstream server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
            log::info!("Downstream server shutting down.");
        })
        .await?;
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn health_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "OK")
}

/// Parses one consumer frame into a request owned by `endpoint_id`.
/// A frame that is not a request yields the error response to send back.
fn parse_request(text: &str, endpoint_id: &str) -> std::result::Result<Request, Response> {
    let value: Value = serde_json::from_str(text).map_err(|e| {
        Response::new(ResponseType::Error, "").with_error(&FeedError::Parse(e.to_string()))
    })?;
    let field = |name: &str| value.get(name).and_then(Value::as_str).unwrap_or_default().to_string();
    let provider_id = field("providerId");
    let request_id = field("requestId");

    let mut request: Request = serde_json::from_value(value).map_err(|e| {
        Response::new(ResponseType::Error, provider_id.clone())
            .correlate(&request_id)
            .with_error(&FeedError::Parse(e.to_string()))
    })?;
    // Consumers never pick their own endpoint
    request.endpoint_id = endpoint_id.to_string();
    Ok(request)
}

async fn send_response(socket: &mut WebSocket, response: &Response, send_timeout: Duration) -> bool {
    let json = match serde_json::to_string(response) {
        Ok(json) => json,
        Err(e) => {
            log::error!("Failed to encode response for '{}': {}", response.provider_id, e);
            return true;
        }
    };
    match tokio::time::timeout(send_timeout, socket.send(Message::Text(json.into()))).await {
        Ok(Ok(())) => true,
        Ok(Err(_)) => false,
        Err(_) => {
            log::warn!("Consumer write blocked for more than {:?}, dropping it", send_timeout);
            false
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
    let endpoint_id = format!("ws-{}", client_id);
    let mut responses = match state.mux.attach(&endpoint_id) {
        Ok(rx) => rx,
        Err(e) => {
            log::error!("Client {} rejected: {}", client_id, e);
            return;
        }
    };
    log::info!("Client {} connected as endpoint '{}'", client_id, endpoint_id);

    loop {
        tokio::select! {
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => match parse_request(text.as_str(), &endpoint_id) {
                        Ok(request) => {
                            if state.mux.request(request).is_err() {
                                log::warn!("Multiplexer gone, closing client {}", client_id);
                                break;
                            }
                        }
                        Err(reply) => {
                            log::debug!("Client {} sent an unreadable request", client_id);
                            if !send_response(&mut socket, &reply, state.send_timeout).await {
                                break;
                            }
                        }
                    },
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            response = responses.recv() => {
                let Some(response) = response else { break };
                if !send_response(&mut socket, &response, state.send_timeout).await {
                    break;
                }
            }
        }
    }

    let _ = state.mux.detach(&endpoint_id);
    log::info!("Client {} disconnected", client_id);
}
