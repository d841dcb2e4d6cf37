//! # STOMP-over-WebSocket Link
//!
//! The production `Link`: a WebSocket connection (`tokio-tungstenite`) that
//! speaks a STOMP 1.2 subset. `open` sends `CONNECT` and waits for
//! `CONNECTED`; `subscribe` and `publish` map to `SUBSCRIBE` and `SEND`;
//! inbound `MESSAGE` frames become `LinkFrame::Message`. Heart-beats are
//! end-of-line text messages in both directions.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::{FeedError, Result};
use crate::model::ProviderConfig;
use crate::transport::stomp::{self, Decoded, StompFrame};
use crate::transport::{Link, LinkFactory, LinkFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct StompWsLink {
    url: Url,
    headers: BTreeMap<String, String>,
    heartbeat: Duration,
    stream: Option<WsStream>,
    next_subscription: u32,
}

impl StompWsLink {
    pub fn new(url: Url, headers: BTreeMap<String, String>, heartbeat: Duration) -> Self {
        Self {
            url,
            headers,
            heartbeat,
            stream: None,
            next_subscription: 0,
        }
    }

    async fn send_frame(&mut self, frame: StompFrame) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| FeedError::Connection("link is not open".to_string()))?;
        stream
            .send(Message::Text(frame.encode().into()))
            .await
            .map_err(|e| FeedError::Connection(format!("failed to send {}: {}", frame.command, e)))
    }

    /// Reads until the broker answers the CONNECT frame.
    async fn await_connected(&mut self) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| FeedError::Connection("link is not open".to_string()))?;
        while let Some(message) = stream.next().await {
            let text = match message {
                Ok(Message::Text(text)) => text.as_str().to_string(),
                Ok(Message::Binary(bin)) => String::from_utf8_lossy(&bin).into_owned(),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => return Err(FeedError::Connection(format!("handshake failed: {}", e))),
            };
            match stomp::decode(&text)? {
                Decoded::Frame(frame) if frame.command == "CONNECTED" => {
                    log::debug!(
                        "STOMP session established with {} (server heart-beat {:?})",
                        self.url,
                        frame.get("heart-beat")
                    );
                    return Ok(());
                }
                Decoded::Frame(frame) if frame.command == "ERROR" => {
                    return Err(FeedError::Connection(format!(
                        "broker rejected CONNECT: {}",
                        frame.get("message").unwrap_or(frame.body.as_str())
                    )));
                }
                _ => continue,
            }
        }
        Err(FeedError::Connection("connection closed during handshake".to_string()))
    }
}

#[async_trait]
impl Link for StompWsLink {
    async fn open(&mut self) -> Result<()> {
        self.close().await;
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| FeedError::Connection(format!("failed to connect to {}: {}", self.url, e)))?;
        self.stream = Some(stream);

        let beat = self.heartbeat.as_millis().to_string();
        let mut connect = StompFrame::new("CONNECT")
            .header("accept-version", "1.2")
            .header("host", self.url.host_str().unwrap_or("localhost"))
            .header("heart-beat", format!("{},{}", beat, beat));
        for (name, value) in &self.headers {
            connect = connect.header(name, value.clone());
        }
        self.send_frame(connect).await?;
        self.await_connected().await
    }

    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        let id = format!("sub-{}", self.next_subscription);
        self.next_subscription += 1;
        self.send_frame(
            StompFrame::new("SUBSCRIBE")
                .header("id", id)
                .header("destination", topic)
                .header("ack", "auto"),
        )
        .await
    }

    async fn publish(&mut self, topic: &str, body: &str) -> Result<()> {
        self.send_frame(
            StompFrame::new("SEND")
                .header("destination", topic)
                .header("content-type", "text/plain")
                .body(body),
        )
        .await
    }

    async fn heartbeat(&mut self) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| FeedError::Connection("link is not open".to_string()))?;
        stream
            .send(Message::Text("\n".to_string().into()))
            .await
            .map_err(|e| FeedError::Connection(format!("heart-beat failed: {}", e)))
    }

    async fn recv(&mut self) -> LinkFrame {
        loop {
            let Some(stream) = self.stream.as_mut() else {
                return LinkFrame::Closed("link is not open".to_string());
            };
            let text = match stream.next().await {
                Some(Ok(Message::Text(text))) => text.as_str().to_string(),
                Some(Ok(Message::Binary(bin))) => String::from_utf8_lossy(&bin).into_owned(),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => return LinkFrame::Heartbeat,
                Some(Ok(Message::Frame(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    self.stream = None;
                    let reason = frame
                        .map(|f| f.reason.as_str().to_string())
                        .unwrap_or_else(|| "closed by remote host".to_string());
                    return LinkFrame::Closed(reason);
                }
                Some(Err(e)) => {
                    self.stream = None;
                    return LinkFrame::Closed(format!("read error: {}", e));
                }
                None => {
                    self.stream = None;
                    return LinkFrame::Closed("stream ended".to_string());
                }
            };

            match stomp::decode(&text) {
                Ok(Decoded::Heartbeat) => return LinkFrame::Heartbeat,
                Ok(Decoded::Frame(frame)) => match frame.command.as_str() {
                    "MESSAGE" => {
                        return LinkFrame::Message {
                            topic: frame.get("destination").unwrap_or_default().to_string(),
                            body: frame.body,
                        }
                    }
                    "ERROR" => {
                        self.close().await;
                        return LinkFrame::Closed(format!(
                            "broker error: {}",
                            frame.get("message").unwrap_or(frame.body.as_str())
                        ));
                    }
                    other => log::trace!("Ignoring STOMP {} frame", other),
                },
                Err(e) => log::warn!("Dropping undecodable STOMP message from {}: {}", self.url, e),
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let disconnect = StompFrame::new("DISCONNECT").encode();
            let _ = stream.send(Message::Text(disconnect.into())).await;
            let _ = stream.close(None).await;
        }
    }
}

/// Builds a `StompWsLink` from each provider config.
#[derive(Debug, Default, Clone)]
pub struct StompWsLinkFactory;

impl LinkFactory for StompWsLinkFactory {
    fn create(&self, config: &ProviderConfig) -> Result<Box<dyn Link>> {
        let url = Url::parse(&config.url)
            .map_err(|e| FeedError::Configuration(format!("invalid url '{}': {}", config.url, e)))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(FeedError::Configuration(format!(
                    "unsupported url scheme '{}', expected ws or wss",
                    other
                )))
            }
        }
        Ok(Box::new(StompWsLink::new(url, config.headers.clone(), config.heartbeat())))
    }
}
