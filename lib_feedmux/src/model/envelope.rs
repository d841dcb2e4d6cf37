//! # Request / Response Envelopes
//!
//! The messages exchanged between endpoints and the multiplexer. Both sides
//! serialize to camelCase JSON so the same envelopes travel unchanged over the
//! server's WebSocket.
//!
//! A response with a `requestId` answers exactly one request of one endpoint.
//! A response without one is a broadcast to every subscriber of the provider.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorBody, FeedError};
use crate::model::config::ProviderConfig;
use crate::model::row::Row;
use crate::model::stats::Statistics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestType {
    Subscribe,
    Unsubscribe,
    GetSnapshot,
    GetStatus,
    Configure,
    Refresh,
    /// Anything this build does not understand.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[serde(rename = "type")]
    pub kind: RequestType,
    #[serde(default)]
    pub provider_id: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub endpoint_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ProviderConfig>,
}

impl Request {
    pub fn new(kind: RequestType, provider_id: impl Into<String>) -> Self {
        Self {
            kind,
            provider_id: provider_id.into(),
            request_id: String::new(),
            endpoint_id: String::new(),
            config: None,
        }
    }

    pub fn with_config(mut self, config: ProviderConfig) -> Self {
        self.config = Some(config);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseType {
    Snapshot,
    Update,
    Status,
    Error,
    Subscribed,
    Unsubscribed,
    /// Downstream must drop its rows; a fresh snapshot follows.
    Clear,
    Configured,
    Refreshing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(rename = "type")]
    pub kind: ResponseType,
    pub provider_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<Row>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    /// Per-provider flush sequence of a snapshot batch or update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics: Option<Statistics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub timestamp: DateTime<Utc>,
}

impl Response {
    pub fn new(kind: ResponseType, provider_id: impl Into<String>) -> Self {
        Self {
            kind,
            provider_id: provider_id.into(),
            request_id: None,
            data: None,
            row_count: None,
            sequence: None,
            statistics: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Error answer to one request.
    pub fn error_for(request: &Request, error: &FeedError) -> Self {
        Self::new(ResponseType::Error, request.provider_id.clone())
            .correlate(&request.request_id)
            .with_error(error)
    }

    pub fn correlate(mut self, request_id: &str) -> Self {
        if !request_id.is_empty() {
            self.request_id = Some(request_id.to_string());
        }
        self
    }

    pub fn with_rows(mut self, rows: Vec<Row>) -> Self {
        self.row_count = Some(rows.len());
        self.data = Some(rows);
        self
    }

    pub fn with_sequence(mut self, sequence: u64, timestamp: DateTime<Utc>) -> Self {
        self.sequence = Some(sequence);
        self.timestamp = timestamp;
        self
    }

    pub fn with_statistics(mut self, statistics: Statistics) -> Self {
        self.statistics = Some(statistics);
        self
    }

    pub fn with_error(mut self, error: &FeedError) -> Self {
        self.error = Some(error.to_body());
        self
    }

    /// A broadcast is any response not tied to a request.
    pub fn is_broadcast(&self) -> bool {
        self.request_id.is_none()
    }
}
