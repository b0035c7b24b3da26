// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transport capabilities the gateway consumes.
//!
//! The core never talks to a broker directly; it depends on two narrow
//! capability traits. Outbound calls go through [`ShadowTransport`] and
//! [`MessageTransport`]; inbound events (status, delta, timeout,
//! connect/disconnect) are delivered by the embedding layer as explicit
//! method calls on the synchronizer and publisher rather than through an
//! ambient event bus.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("not connected")]
    NotConnected,
}

/// The `reported`/`desired` partitions of a shadow document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShadowState {
    #[serde(default)]
    pub reported: Option<Value>,
    #[serde(default)]
    pub desired: Option<Value>,
}

/// Response carried by an accepted get/update status.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusResponse {
    #[serde(default)]
    pub state: ShadowState,
}

/// Rejection code carried by a failed get/update status. `404` is the
/// distinguished "no such shadow" code.
pub const NOT_FOUND: u16 = 404;

/// Outcome of a shadow get or update request, delivered asynchronously by
/// the transport together with the request's client token.
#[derive(Debug, Clone)]
pub enum StatusOutcome {
    Accepted(StatusResponse),
    Rejected { code: u16 },
}

/// An update request tagged with a client token for status correlation.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub token: String,
    pub payload: Value,
}

/// Options for a message publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    pub qos: u8,
}

/// Shadow get/update capability, per thing.
#[async_trait]
pub trait ShadowTransport: Send + Sync {
    /// Request the current shadow document. The outcome arrives later via
    /// a status event carrying the same token.
    async fn get(&self, thing: &str, token: &str) -> Result<(), TransportError>;

    /// Send a (partial) state update. The outcome arrives later via a
    /// status event carrying the request's token.
    async fn update(&self, thing: &str, request: UpdateRequest) -> Result<(), TransportError>;
}

/// Fire-and-confirm message publish capability.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), TransportError>;
}
