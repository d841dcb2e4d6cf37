//! Scripted in-memory link for driving a real multiplexer from tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lib_feedmux::{
    ClientEvent, ClientHandle, FeedError, Link, LinkFactory, LinkFrame, Multiplexer, MultiplexerHandle,
    MultiplexerSettings, ProviderConfig, Result,
};
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Default)]
pub struct MockState {
    pub opened: usize,
    pub closed: usize,
    pub subscribed: Vec<String>,
    pub published: Vec<(String, String)>,
}

/// Test-side control of one created link.
#[derive(Clone)]
pub struct MockControl {
    frames: mpsc::UnboundedSender<LinkFrame>,
    state: Arc<Mutex<MockState>>,
}

impl MockControl {
    /// Delivers a message body on the listener topic.
    pub fn push(&self, body: &str) {
        let _ = self.frames.send(LinkFrame::Message {
            topic: "listener".to_string(),
            body: body.to_string(),
        });
    }

    pub fn drop_link(&self, reason: &str) {
        let _ = self.frames.send(LinkFrame::Closed(reason.to_string()));
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.state.lock().unwrap().subscribed.clone()
    }

    pub fn opened(&self) -> usize {
        self.state.lock().unwrap().opened
    }

    pub fn closed(&self) -> usize {
        self.state.lock().unwrap().closed
    }
}

pub struct MockLink {
    frames: mpsc::UnboundedReceiver<LinkFrame>,
    state: Arc<Mutex<MockState>>,
    fail_open: bool,
}

#[async_trait]
impl Link for MockLink {
    async fn open(&mut self) -> Result<()> {
        if self.fail_open {
            return Err(FeedError::Connection("connection refused".to_string()));
        }
        self.state.lock().unwrap().opened += 1;
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.state.lock().unwrap().subscribed.push(topic.to_string());
        Ok(())
    }

    async fn publish(&mut self, topic: &str, body: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .published
            .push((topic.to_string(), body.to_string()));
        Ok(())
    }

    async fn heartbeat(&mut self) -> Result<()> {
        Ok(())
    }

    async fn recv(&mut self) -> LinkFrame {
        match self.frames.recv().await {
            Some(frame) => frame,
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {
        self.state.lock().unwrap().closed += 1;
    }
}

/// Records every link it creates so tests can script them.
#[derive(Default)]
pub struct MockLinkFactory {
    created: Mutex<Vec<(String, MockControl)>>,
    refuse: Mutex<Vec<String>>,
}

impl MockLinkFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Links created for `provider_id` from now on fail their handshake.
    pub fn refuse(&self, provider_id: &str) {
        self.refuse.lock().unwrap().push(provider_id.to_string());
    }

    pub fn links_created(&self, provider_id: &str) -> usize {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == provider_id)
            .count()
    }

    /// The most recent link created for `provider_id`, waiting for it if needed.
    pub async fn control(&self, provider_id: &str) -> MockControl {
        for _ in 0..500 {
            let latest = self
                .created
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(id, _)| id == provider_id)
                .map(|(_, control)| control.clone());
            if let Some(control) = latest {
                return control;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("no link created for provider '{provider_id}'");
    }
}

impl LinkFactory for MockLinkFactory {
    fn create(&self, config: &ProviderConfig) -> Result<Box<dyn Link>> {
        let (frames, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(MockState::default()));
        let fail_open = self.refuse.lock().unwrap().contains(&config.id);
        self.created.lock().unwrap().push((
            config.id.clone(),
            MockControl {
                frames,
                state: state.clone(),
            },
        ));
        Ok(Box::new(MockLink {
            frames: rx,
            state,
            fail_open,
        }))
    }
}

/// Short timers so tests run quickly on the real clock.
pub fn fast_settings() -> MultiplexerSettings {
    MultiplexerSettings {
        batch_size: 500,
        snapshot_debounce: Duration::from_millis(10),
        conflation_window: Duration::from_millis(40),
    }
}

pub fn spawn_mux(factory: Arc<MockLinkFactory>) -> MultiplexerHandle {
    let (handle, _task) = Multiplexer::spawn(factory, fast_settings());
    handle
}

/// The snapshot-then-stream provider used throughout the suite.
pub fn positions_config(id: &str) -> ProviderConfig {
    ProviderConfig {
        id: id.to_string(),
        url: "ws://broker.test/stomp".to_string(),
        listener_topic: format!("/snap/pos/{id}"),
        request_message: Some(format!("/snap/pos/{id}/1000")),
        request_body: Some("START".to_string()),
        snapshot_end_token: Some("Success".to_string()),
        key_column: "id".to_string(),
        heartbeat_ms: 0,
        ..ProviderConfig::default()
    }
}

/// A stream-only provider: no trigger, no end-token.
pub fn stream_config(id: &str) -> ProviderConfig {
    ProviderConfig {
        id: id.to_string(),
        url: "ws://broker.test/stomp".to_string(),
        listener_topic: format!("/stream/{id}"),
        key_column: "id".to_string(),
        heartbeat_ms: 0,
        ..ProviderConfig::default()
    }
}

/// Polls `check` until it holds or about two seconds pass.
pub async fn wait_until<F: FnMut() -> bool>(mut check: F) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Polls the provider's status until its transport is connected.
pub async fn wait_connected(client: &ClientHandle, provider_id: &str) {
    for _ in 0..400 {
        if let Ok(status) = client.get_status(provider_id).await {
            if status.is_connected {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("provider '{provider_id}' never connected");
}

/// Waits for the next event matching `pred`.
pub async fn next_event<F: Fn(&ClientEvent) -> bool>(
    events: &mut broadcast::Receiver<ClientEvent>,
    pred: F,
) -> ClientEvent {
    let deadline = Duration::from_secs(2);
    tokio::time::timeout(deadline, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
