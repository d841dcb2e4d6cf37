//! # Client Handle
//!
//! An endpoint's view of the multiplexer. `ClientHandle` attaches itself
//! under a process-unique endpoint id, turns each request into a future that
//! resolves with the response carrying the same request id, and republishes
//! every broadcast (snapshot batches, updates, status, errors, clears) as a
//! `ClientEvent`.
//!
//! A request that gets no answer within the timeout fails with
//! `FeedError::RequestTimeout` and its pending entry is removed; a response
//! arriving after that is ignored.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use crate::core::MultiplexerHandle;
use crate::error::{ErrorBody, FeedError, Result};
use crate::model::{ProviderConfig, Request, RequestType, Response, ResponseType, Row, Statistics};

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const EVENT_CAPACITY: usize = 1024;

type Pending = Arc<Mutex<HashMap<String, oneshot::Sender<Arc<Response>>>>>;

/// A broadcast received from a subscribed provider.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Snapshot { provider_id: String, rows: Vec<Row>, sequence: Option<u64> },
    Update { provider_id: String, rows: Vec<Row>, sequence: Option<u64> },
    Status { provider_id: String, statistics: Statistics },
    Error { provider_id: String, error: ErrorBody },
    /// Drop every row held for the provider; a new snapshot follows.
    Clear { provider_id: String },
}

impl ClientEvent {
    fn from_broadcast(response: &Response) -> Option<Self> {
        let provider_id = response.provider_id.clone();
        let event = match response.kind {
            ResponseType::Snapshot => ClientEvent::Snapshot {
                provider_id,
                rows: response.data.clone().unwrap_or_default(),
                sequence: response.sequence,
            },
            ResponseType::Update => ClientEvent::Update {
                provider_id,
                rows: response.data.clone().unwrap_or_default(),
                sequence: response.sequence,
            },
            ResponseType::Status => ClientEvent::Status {
                provider_id,
                statistics: response.statistics.clone().unwrap_or_default(),
            },
            ResponseType::Error => ClientEvent::Error {
                provider_id,
                error: response.error.clone().unwrap_or(ErrorBody {
                    kind: "unknown".to_string(),
                    message: String::new(),
                }),
            },
            ResponseType::Clear => ClientEvent::Clear { provider_id },
            _ => return None,
        };
        Some(event)
    }

    pub fn provider_id(&self) -> &str {
        match self {
            ClientEvent::Snapshot { provider_id, .. }
            | ClientEvent::Update { provider_id, .. }
            | ClientEvent::Status { provider_id, .. }
            | ClientEvent::Error { provider_id, .. }
            | ClientEvent::Clear { provider_id } => provider_id,
        }
    }
}

pub struct ClientHandle {
    endpoint_id: String,
    mux: MultiplexerHandle,
    pending: Pending,
    joined: Mutex<BTreeSet<String>>,
    events: broadcast::Sender<ClientEvent>,
    request_timeout: Duration,
    reader: JoinHandle<()>,
}

impl ClientHandle {
    pub fn new(mux: MultiplexerHandle) -> Result<Self> {
        Self::with_timeout(mux, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(mux: MultiplexerHandle, request_timeout: Duration) -> Result<Self> {
        let id = NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed);
        let endpoint_id = format!("endpoint-{}", id);
        let inbound = mux.attach(&endpoint_id)?;

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let reader = tokio::spawn(read_responses(endpoint_id.clone(), inbound, pending.clone(), events.clone()));
        log::debug!("Client '{}' attached", endpoint_id);

        Ok(Self {
            endpoint_id,
            mux,
            pending,
            joined: Mutex::new(BTreeSet::new()),
            events,
            request_timeout,
            reader,
        })
    }

    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    /// A new receiver for broadcasts from every provider this client joined.
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Requests still waiting for their response.
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().expect("Pending lock poisoned").len()
    }

    /// Providers this client is subscribed to.
    pub fn subscriptions(&self) -> Vec<String> {
        self.joined.lock().expect("Joined lock poisoned").iter().cloned().collect()
    }

    /// Sends `request` and waits for the correlated response. Error responses
    /// come back as `FeedError::Remote`.
    pub async fn send_request(&self, mut request: Request) -> Result<Arc<Response>> {
        let request_id = Uuid::new_v4().to_string();
        request.request_id = request_id.clone();
        request.endpoint_id = self.endpoint_id.clone();

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("Pending lock poisoned")
            .insert(request_id.clone(), tx);

        if let Err(e) = self.mux.request(request) {
            self.forget(&request_id);
            return Err(e);
        }

        let response = match timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => {
                return Err(FeedError::ChannelClosed(format!(
                    "client '{}' disconnected before request '{}' was answered",
                    self.endpoint_id, request_id
                )))
            }
            Err(_) => {
                self.forget(&request_id);
                log::warn!("Client '{}': request '{}' timed out", self.endpoint_id, request_id);
                return Err(FeedError::RequestTimeout {
                    request_id,
                    timeout_ms: self.request_timeout.as_millis() as u64,
                });
            }
        };

        match (&response.kind, &response.error) {
            (ResponseType::Error, Some(body)) => Err(FeedError::from(body.clone())),
            (ResponseType::Error, None) => Err(FeedError::Remote {
                kind: "unknown".to_string(),
                message: "error response without details".to_string(),
            }),
            _ => Ok(response),
        }
    }

    fn forget(&self, request_id: &str) {
        self.pending.lock().expect("Pending lock poisoned").remove(request_id);
    }

    /// Joins a provider, creating its session if needed.
    pub async fn subscribe(&self, provider_id: &str, config: Option<ProviderConfig>) -> Result<Statistics> {
        let mut request = Request::new(RequestType::Subscribe, provider_id);
        request.config = config;
        let response = self.send_request(request).await?;
        self.joined
            .lock()
            .expect("Joined lock poisoned")
            .insert(provider_id.to_string());
        Ok(response.statistics.clone().unwrap_or_default())
    }

    pub async fn unsubscribe(&self, provider_id: &str) -> Result<()> {
        self.send_request(Request::new(RequestType::Unsubscribe, provider_id)).await?;
        self.joined.lock().expect("Joined lock poisoned").remove(provider_id);
        Ok(())
    }

    /// The provider's full current state. Waits for a running snapshot to
    /// finish.
    pub async fn get_snapshot(&self, provider_id: &str) -> Result<Vec<Row>> {
        let response = self
            .send_request(Request::new(RequestType::GetSnapshot, provider_id))
            .await?;
        Ok(response.data.clone().unwrap_or_default())
    }

    pub async fn get_status(&self, provider_id: &str) -> Result<Statistics> {
        let response = self
            .send_request(Request::new(RequestType::GetStatus, provider_id))
            .await?;
        Ok(response.statistics.clone().unwrap_or_default())
    }

    /// Drops the provider's rows and re-runs its snapshot.
    pub async fn refresh(&self, provider_id: &str) -> Result<()> {
        self.send_request(Request::new(RequestType::Refresh, provider_id)).await?;
        Ok(())
    }

    /// Registers a provider config for later subscribes.
    pub async fn configure(&self, config: ProviderConfig) -> Result<()> {
        let request = Request::new(RequestType::Configure, config.id.clone()).with_config(config);
        self.send_request(request).await?;
        Ok(())
    }

    /// Leaves every joined provider, fails outstanding requests and detaches
    /// from the multiplexer. Safe to call more than once.
    pub async fn disconnect(&self) {
        for provider_id in self.subscriptions() {
            if let Err(e) = self.unsubscribe(&provider_id).await {
                log::debug!("Client '{}': unsubscribe from '{}' failed: {}", self.endpoint_id, provider_id, e);
            }
        }
        self.joined.lock().expect("Joined lock poisoned").clear();
        self.pending.lock().expect("Pending lock poisoned").clear();
        if self.mux.detach(&self.endpoint_id).is_err() {
            log::debug!("Client '{}': multiplexer already stopped", self.endpoint_id);
        }
    }
}

impl Drop for ClientHandle {
    fn drop(&mut self) {
        let _ = self.mux.detach(&self.endpoint_id);
        self.reader.abort();
    }
}

async fn read_responses(
    endpoint_id: String,
    mut inbound: mpsc::UnboundedReceiver<Arc<Response>>,
    pending: Pending,
    events: broadcast::Sender<ClientEvent>,
) {
    while let Some(response) = inbound.recv().await {
        if let Some(request_id) = response.request_id.as_deref() {
            let waiter = pending.lock().expect("Pending lock poisoned").remove(request_id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(response);
                }
                None => log::debug!("Client '{}': ignoring late response '{}'", endpoint_id, request_id),
            }
            continue;
        }
        if let Some(event) = ClientEvent::from_broadcast(&response) {
            // No receivers is fine: nobody is listening for broadcasts.
            let _ = events.send(event);
        }
    }
    log::debug!("Client '{}' inbound channel closed", endpoint_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SessionMode;

    #[test]
    fn broadcasts_map_to_events() {
        let response = Response::new(ResponseType::Clear, "abc");
        assert_eq!(
            ClientEvent::from_broadcast(&response),
            Some(ClientEvent::Clear { provider_id: "abc".into() })
        );

        let mut stats = Statistics::default();
        stats.mode = SessionMode::Realtime;
        let status = Response::new(ResponseType::Status, "abc").with_statistics(stats.clone());
        let event = ClientEvent::from_broadcast(&status).unwrap();
        assert_eq!(event.provider_id(), "abc");
        assert_eq!(event, ClientEvent::Status { provider_id: "abc".into(), statistics: stats });

        let subscribed = Response::new(ResponseType::Subscribed, "abc");
        assert!(ClientEvent::from_broadcast(&subscribed).is_none());
    }
}
