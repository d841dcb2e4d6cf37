//! # Multiplexer
//!
//! Routes endpoint requests to provider sessions and keeps exactly one
//! session (and so one upstream transport) per provider, shared by every
//! endpoint subscribed to it.
//!
//! The multiplexer is an actor. All state lives in `Multiplexer` and is only
//! touched by its `run` loop; endpoints, transport tasks and timers talk to it
//! through one unbounded inbox of `MuxInput` messages. There are no locks on
//! the hot path and no two handlers ever observe a half-applied change.
//!
//! ## Session lifetime
//!
//! - The first `subscribe` for a provider creates its session with the config
//!   carried by the request, or one registered earlier with `configure`.
//! - Later subscribers join the existing session and never open a second
//!   transport.
//! - When the last subscriber leaves (unsubscribe, detach or a failed
//!   delivery), the session is torn down. Its generation number retires with
//!   it, so transport events still in flight for it are discarded.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::dispatcher::EndpointSink;
use crate::core::session::{Directed, ProviderSession};
use crate::error::{FeedError, Result};
use crate::model::{ProviderConfig, Request, RequestType, Response, ResponseType};
use crate::transport::{LinkFactory, TransportEvent};

/// Multiplexer-wide defaults. Provider configs may override batch size and
/// conflation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiplexerSettings {
    pub batch_size: usize,
    pub snapshot_debounce: Duration,
    pub conflation_window: Duration,
}

impl Default for MultiplexerSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            snapshot_debounce: Duration::from_millis(50),
            conflation_window: Duration::from_millis(100),
        }
    }
}

/// Everything the multiplexer task reacts to.
#[derive(Debug)]
pub enum MuxInput {
    /// Registers an endpoint and the sink its responses go to.
    Attach { endpoint_id: String, sink: EndpointSink },
    /// Removes an endpoint from every session it joined.
    Detach { endpoint_id: String },
    Request(Request),
    Transport {
        provider_id: String,
        generation: u64,
        event: TransportEvent,
    },
    FlushDue {
        provider_id: String,
        generation: u64,
        epoch: u64,
    },
    Shutdown,
}

/// Cloneable sender side of the multiplexer inbox.
#[derive(Debug, Clone)]
pub struct MultiplexerHandle {
    inbox: mpsc::UnboundedSender<MuxInput>,
}

impl MultiplexerHandle {
    fn send(&self, input: MuxInput) -> Result<()> {
        self.inbox
            .send(input)
            .map_err(|_| FeedError::ChannelClosed("multiplexer has stopped".to_string()))
    }

    /// Registers `endpoint_id` and returns the receiver for its responses.
    pub fn attach(&self, endpoint_id: &str) -> Result<mpsc::UnboundedReceiver<Arc<Response>>> {
        let (sink, rx) = mpsc::unbounded_channel();
        self.send(MuxInput::Attach {
            endpoint_id: endpoint_id.to_string(),
            sink,
        })?;
        Ok(rx)
    }

    pub fn detach(&self, endpoint_id: &str) -> Result<()> {
        self.send(MuxInput::Detach {
            endpoint_id: endpoint_id.to_string(),
        })
    }

    pub fn request(&self, request: Request) -> Result<()> {
        self.send(MuxInput::Request(request))
    }

    /// Tears down every session and stops the run loop.
    pub fn shutdown(&self) -> Result<()> {
        self.send(MuxInput::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }
}

pub struct Multiplexer {
    factory: Arc<dyn LinkFactory>,
    settings: MultiplexerSettings,
    inbox: mpsc::UnboundedSender<MuxInput>,
    endpoints: HashMap<String, EndpointSink>,
    configs: HashMap<String, ProviderConfig>,
    sessions: HashMap<String, ProviderSession>,
    next_generation: u64,
}

impl Multiplexer {
    /// Builds the actor and the receiver its `run` loop consumes.
    pub fn new(
        factory: Arc<dyn LinkFactory>,
        settings: MultiplexerSettings,
    ) -> (Self, mpsc::UnboundedReceiver<MuxInput>) {
        let (inbox, rx) = mpsc::unbounded_channel();
        let mux = Self {
            factory,
            settings,
            inbox,
            endpoints: HashMap::new(),
            configs: HashMap::new(),
            sessions: HashMap::new(),
            next_generation: 0,
        };
        (mux, rx)
    }

    /// Builds the actor and runs it on its own task.
    pub fn spawn(factory: Arc<dyn LinkFactory>, settings: MultiplexerSettings) -> (MultiplexerHandle, JoinHandle<()>) {
        let (mux, rx) = Self::new(factory, settings);
        let handle = mux.handle();
        let task = tokio::spawn(mux.run(rx));
        (handle, task)
    }

    pub fn handle(&self) -> MultiplexerHandle {
        MultiplexerHandle {
            inbox: self.inbox.clone(),
        }
    }

    pub fn settings(&self) -> &MultiplexerSettings {
        &self.settings
    }

    pub fn session(&self, provider_id: &str) -> Option<&ProviderSession> {
        self.sessions.get(provider_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Registers a provider config ahead of any subscribe.
    pub fn register(&mut self, config: ProviderConfig) -> Result<()> {
        config.validate()?;
        log::info!("Registered provider '{}' ({})", config.id, config.label());
        self.configs.insert(config.id.clone(), config);
        Ok(())
    }

    pub async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<MuxInput>) {
        log::info!("Multiplexer started");
        while let Some(input) = inbox.recv().await {
            if !self.process(input) {
                break;
            }
        }
        self.shutdown();
        log::info!("Multiplexer stopped");
    }

    /// Applies one input. Returns `false` once the loop should stop.
    pub fn process(&mut self, input: MuxInput) -> bool {
        match input {
            MuxInput::Attach { endpoint_id, sink } => {
                if self.endpoints.insert(endpoint_id.clone(), sink).is_some() {
                    log::warn!("Endpoint '{}' re-attached, replacing its sink", endpoint_id);
                } else {
                    log::debug!("Endpoint '{}' attached", endpoint_id);
                }
            }
            MuxInput::Detach { endpoint_id } => self.detach_endpoint(&endpoint_id),
            MuxInput::Request(request) => self.handle_request(request),
            MuxInput::Transport { provider_id, generation, event } => {
                let answers = match self.live_session(&provider_id, generation) {
                    Some(session) => session.handle_transport(event),
                    None => {
                        log::trace!("[{}] Ignoring event from retired generation {}", provider_id, generation);
                        return true;
                    }
                };
                self.deliver(answers);
                self.reap(&provider_id);
            }
            MuxInput::FlushDue { provider_id, generation, epoch } => {
                if let Some(session) = self.live_session(&provider_id, generation) {
                    session.on_flush_due(epoch);
                }
                self.reap(&provider_id);
            }
            MuxInput::Shutdown => return false,
        }
        true
    }

    fn live_session(&mut self, provider_id: &str, generation: u64) -> Option<&mut ProviderSession> {
        self.sessions
            .get_mut(provider_id)
            .filter(|session| session.generation() == generation)
    }

    fn shutdown(&mut self) {
        for (_, mut session) in self.sessions.drain() {
            session.teardown();
        }
        self.endpoints.clear();
    }

    // ── Requests ────────────────────────────────────────────────────────────

    fn handle_request(&mut self, request: Request) {
        if !self.endpoints.contains_key(&request.endpoint_id) {
            log::warn!(
                "Dropping {:?} request '{}' from unattached endpoint '{}'",
                request.kind,
                request.request_id,
                request.endpoint_id
            );
            return;
        }
        if request.kind == RequestType::Unknown {
            let error = FeedError::Configuration("unknown request type".to_string());
            self.reply_error(&request, &error);
            return;
        }
        if request.provider_id.is_empty() {
            let error = FeedError::Configuration("request is missing providerId".to_string());
            self.reply_error(&request, &error);
            return;
        }

        log::debug!(
            "[{}] {:?} request '{}' from '{}'",
            request.provider_id,
            request.kind,
            request.request_id,
            request.endpoint_id
        );
        let outcome = match request.kind {
            RequestType::Subscribe => self.subscribe(&request),
            RequestType::Unsubscribe => self.unsubscribe(&request),
            RequestType::GetSnapshot => self.get_snapshot(&request),
            RequestType::GetStatus => self.get_status(&request),
            RequestType::Configure => self.configure(&request),
            RequestType::Refresh => self.refresh(&request),
            RequestType::Unknown => Ok(()),
        };
        if let Err(error) = outcome {
            log::warn!("[{}] {:?} request failed: {}", request.provider_id, request.kind, error);
            self.reply_error(&request, &error);
        }
    }

    fn config_for(&self, request: &Request) -> Result<ProviderConfig> {
        let mut config = match request.config.clone() {
            Some(config) => config,
            None => self.configs.get(&request.provider_id).cloned().ok_or_else(|| {
                FeedError::Configuration(format!("no config known for provider '{}'", request.provider_id))
            })?,
        };
        if config.id.is_empty() {
            config.id = request.provider_id.clone();
        }
        if config.id != request.provider_id {
            return Err(FeedError::Configuration(format!(
                "config id '{}' does not match providerId '{}'",
                config.id, request.provider_id
            )));
        }
        config.validate()?;
        Ok(config)
    }

    fn subscribe(&mut self, request: &Request) -> Result<()> {
        let provider_id = request.provider_id.as_str();
        let Some(sink) = self.endpoints.get(&request.endpoint_id).cloned() else {
            return Ok(());
        };

        if !self.sessions.contains_key(provider_id) {
            let config = self.config_for(request)?;
            self.next_generation += 1;
            let mut session = ProviderSession::new(config.clone(), self.next_generation, &self.settings, self.inbox.clone());
            session.start(self.factory.as_ref())?;
            self.configs.insert(provider_id.to_string(), config);
            self.sessions.insert(provider_id.to_string(), session);
        } else if request.config.is_some() {
            log::debug!("[{}] Session exists, ignoring config carried by subscribe", provider_id);
        }

        let statistics = match self.sessions.get_mut(provider_id) {
            Some(session) => {
                session.add_subscriber(&request.endpoint_id, sink);
                session.statistics()
            }
            None => return Ok(()),
        };
        let response = Response::new(ResponseType::Subscribed, provider_id)
            .correlate(&request.request_id)
            .with_statistics(statistics);
        self.reply(&request.endpoint_id, response);
        Ok(())
    }

    fn unsubscribe(&mut self, request: &Request) -> Result<()> {
        if let Some(session) = self.sessions.get_mut(&request.provider_id) {
            session.remove_subscriber(&request.endpoint_id);
        }
        let response = Response::new(ResponseType::Unsubscribed, request.provider_id.clone()).correlate(&request.request_id);
        self.reply(&request.endpoint_id, response);
        self.reap(&request.provider_id);
        Ok(())
    }

    fn get_snapshot(&mut self, request: &Request) -> Result<()> {
        let session = self
            .sessions
            .get_mut(&request.provider_id)
            .ok_or_else(|| FeedError::NotFound(request.provider_id.clone()))?;
        if let Some(answer) = session.get_snapshot(&request.endpoint_id, &request.request_id) {
            self.deliver(vec![answer]);
        }
        Ok(())
    }

    fn get_status(&mut self, request: &Request) -> Result<()> {
        let statistics = self
            .sessions
            .get(&request.provider_id)
            .map(ProviderSession::statistics)
            .ok_or_else(|| FeedError::NotFound(request.provider_id.clone()))?;
        let response = Response::new(ResponseType::Status, request.provider_id.clone())
            .correlate(&request.request_id)
            .with_statistics(statistics);
        self.reply(&request.endpoint_id, response);
        Ok(())
    }

    fn configure(&mut self, request: &Request) -> Result<()> {
        if request.config.is_none() {
            return Err(FeedError::Configuration("configure request carries no config".to_string()));
        }
        let config = self.config_for(request)?;
        if self.sessions.contains_key(&request.provider_id) {
            log::info!("[{}] Config stored; the running session keeps its current one", request.provider_id);
        }
        self.configs.insert(request.provider_id.clone(), config);
        let response = Response::new(ResponseType::Configured, request.provider_id.clone()).correlate(&request.request_id);
        self.reply(&request.endpoint_id, response);
        Ok(())
    }

    fn refresh(&mut self, request: &Request) -> Result<()> {
        let session = self
            .sessions
            .get_mut(&request.provider_id)
            .ok_or_else(|| FeedError::NotFound(request.provider_id.clone()))?;
        session.refresh()?;
        let response = Response::new(ResponseType::Refreshing, request.provider_id.clone()).correlate(&request.request_id);
        self.reply(&request.endpoint_id, response);
        self.reap(&request.provider_id);
        Ok(())
    }

    // ── Delivery ────────────────────────────────────────────────────────────

    fn reply_error(&mut self, request: &Request, error: &FeedError) {
        let response = Response::error_for(request, error);
        self.reply(&request.endpoint_id, response);
    }

    /// Point-to-point send. An endpoint whose receiver is gone is detached.
    fn reply(&mut self, endpoint_id: &str, response: Response) {
        let delivered = match self.endpoints.get(endpoint_id) {
            Some(sink) => sink.send(Arc::new(response)).is_ok(),
            None => {
                log::debug!("Dropping response for unknown endpoint '{}'", endpoint_id);
                return;
            }
        };
        if !delivered {
            log::warn!("Endpoint '{}' is gone, detaching", endpoint_id);
            self.detach_endpoint(endpoint_id);
        }
    }

    fn deliver(&mut self, answers: Vec<Directed>) {
        for Directed { endpoint_id, response } in answers {
            self.reply(&endpoint_id, response);
        }
    }

    fn detach_endpoint(&mut self, endpoint_id: &str) {
        self.endpoints.remove(endpoint_id);
        let joined: Vec<String> = self
            .sessions
            .iter_mut()
            .filter_map(|(id, session)| session.remove_subscriber(endpoint_id).then(|| id.clone()))
            .collect();
        log::info!("Endpoint '{}' detached from {} session(s)", endpoint_id, joined.len());
        for provider_id in joined {
            self.reap(&provider_id);
        }
    }

    /// Tears the session down once nobody is subscribed.
    fn reap(&mut self, provider_id: &str) {
        let empty = self.sessions.get(provider_id).is_some_and(ProviderSession::is_empty);
        if empty {
            if let Some(mut session) = self.sessions.remove(provider_id) {
                log::info!("[{}] Last subscriber left, closing session", provider_id);
                session.teardown();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Link, LinkFrame};
    use async_trait::async_trait;

    struct IdleLink;

    #[async_trait]
    impl Link for IdleLink {
        async fn open(&mut self) -> Result<()> {
            Ok(())
        }
        async fn subscribe(&mut self, _topic: &str) -> Result<()> {
            Ok(())
        }
        async fn publish(&mut self, _topic: &str, _body: &str) -> Result<()> {
            Ok(())
        }
        async fn heartbeat(&mut self) -> Result<()> {
            Ok(())
        }
        async fn recv(&mut self) -> LinkFrame {
            std::future::pending().await
        }
        async fn close(&mut self) {}
    }

    struct IdleFactory;

    impl LinkFactory for IdleFactory {
        fn create(&self, _config: &ProviderConfig) -> Result<Box<dyn Link>> {
            Ok(Box::new(IdleLink))
        }
    }

    fn config(id: &str) -> ProviderConfig {
        ProviderConfig {
            id: id.into(),
            url: "ws://broker".into(),
            listener_topic: format!("/stream/{id}"),
            key_column: "id".into(),
            heartbeat_ms: 0,
            ..ProviderConfig::default()
        }
    }

    fn request(kind: RequestType, provider: &str, endpoint: &str, id: &str) -> Request {
        let mut request = Request::new(kind, provider);
        request.endpoint_id = endpoint.into();
        request.request_id = id.into();
        request
    }

    fn attach(mux: &mut Multiplexer, endpoint: &str) -> mpsc::UnboundedReceiver<Arc<Response>> {
        let (sink, rx) = mpsc::unbounded_channel();
        mux.process(MuxInput::Attach { endpoint_id: endpoint.into(), sink });
        rx
    }

    fn next_correlated(rx: &mut mpsc::UnboundedReceiver<Arc<Response>>) -> Arc<Response> {
        loop {
            let response = rx.try_recv().expect("expected a response");
            if !response.is_broadcast() {
                return response;
            }
        }
    }

    #[tokio::test]
    async fn two_subscribers_share_one_session() {
        let (mut mux, _rx) = Multiplexer::new(Arc::new(IdleFactory), MultiplexerSettings::default());
        let mut e1 = attach(&mut mux, "e1");
        let mut e2 = attach(&mut mux, "e2");

        mux.process(MuxInput::Request(
            request(RequestType::Subscribe, "p1", "e1", "r1").with_config(config("p1")),
        ));
        mux.process(MuxInput::Request(request(RequestType::Subscribe, "p1", "e2", "r2")));

        assert_eq!(mux.session_count(), 1);
        assert_eq!(mux.session("p1").unwrap().subscriber_count(), 2);
        assert_eq!(next_correlated(&mut e1).kind, ResponseType::Subscribed);
        assert_eq!(next_correlated(&mut e2).request_id.as_deref(), Some("r2"));

        mux.process(MuxInput::Request(request(RequestType::Unsubscribe, "p1", "e1", "r3")));
        assert_eq!(mux.session("p1").unwrap().subscriber_count(), 1);
        mux.process(MuxInput::Request(request(RequestType::Unsubscribe, "p1", "e2", "r4")));
        assert!(mux.session("p1").is_none());
    }

    #[tokio::test]
    async fn subscribe_without_config_is_a_configuration_error() {
        let (mut mux, _rx) = Multiplexer::new(Arc::new(IdleFactory), MultiplexerSettings::default());
        let mut e1 = attach(&mut mux, "e1");
        mux.process(MuxInput::Request(request(RequestType::Subscribe, "p9", "e1", "r1")));
        let response = next_correlated(&mut e1);
        assert_eq!(response.kind, ResponseType::Error);
        assert_eq!(response.error.as_ref().unwrap().kind, "configuration");
        assert_eq!(mux.session_count(), 0);
    }

    #[tokio::test]
    async fn unknown_provider_status_is_not_found() {
        let (mut mux, _rx) = Multiplexer::new(Arc::new(IdleFactory), MultiplexerSettings::default());
        let mut e1 = attach(&mut mux, "e1");
        mux.process(MuxInput::Request(request(RequestType::GetStatus, "ghost", "e1", "r1")));
        let response = next_correlated(&mut e1);
        assert_eq!(response.error.as_ref().unwrap().kind, "notFound");
        assert_eq!(response.request_id.as_deref(), Some("r1"));
    }

    #[tokio::test]
    async fn unknown_request_type_is_answered_point_to_point() {
        let (mut mux, _rx) = Multiplexer::new(Arc::new(IdleFactory), MultiplexerSettings::default());
        let mut e1 = attach(&mut mux, "e1");
        mux.process(MuxInput::Request(request(RequestType::Unknown, "p1", "e1", "r1")));
        assert_eq!(next_correlated(&mut e1).kind, ResponseType::Error);
    }

    #[tokio::test]
    async fn registered_config_is_used_by_subscribe() {
        let (mut mux, _rx) = Multiplexer::new(Arc::new(IdleFactory), MultiplexerSettings::default());
        mux.register(config("p1")).unwrap();
        let mut e1 = attach(&mut mux, "e1");
        mux.process(MuxInput::Request(request(RequestType::Subscribe, "p1", "e1", "r1")));
        assert_eq!(next_correlated(&mut e1).kind, ResponseType::Subscribed);
        assert!(mux.session("p1").is_some());
    }

    #[tokio::test]
    async fn detach_tears_down_sessions_left_empty() {
        let (mut mux, _rx) = Multiplexer::new(Arc::new(IdleFactory), MultiplexerSettings::default());
        let _e1 = attach(&mut mux, "e1");
        mux.process(MuxInput::Request(
            request(RequestType::Subscribe, "p1", "e1", "r1").with_config(config("p1")),
        ));
        mux.process(MuxInput::Request(
            request(RequestType::Subscribe, "p2", "e1", "r2").with_config(config("p2")),
        ));
        assert_eq!(mux.session_count(), 2);
        mux.process(MuxInput::Detach { endpoint_id: "e1".into() });
        assert_eq!(mux.session_count(), 0);
    }

    #[tokio::test]
    async fn events_from_retired_generations_are_ignored() {
        let (mut mux, _rx) = Multiplexer::new(Arc::new(IdleFactory), MultiplexerSettings::default());
        let mut e1 = attach(&mut mux, "e1");
        mux.process(MuxInput::Request(
            request(RequestType::Subscribe, "p1", "e1", "r1").with_config(config("p1")),
        ));
        let generation = mux.session("p1").unwrap().generation();
        while e1.try_recv().is_ok() {}

        mux.process(MuxInput::Transport {
            provider_id: "p1".into(),
            generation: generation + 10,
            event: TransportEvent::Connected,
        });
        assert!(e1.try_recv().is_err());
        assert!(!mux.session("p1").unwrap().statistics().is_connected);
    }
}
