// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # shadow-gateway
//!
//! Edge gateway core: shadow-document state reconciliation and prioritized
//! outbox message publishing, transport-agnostic.
//!
//! ## Architecture
//!
//! ```text
//!                    ┌───────────────┐   get/update    ┌───────────────┐
//!  Service ◀────────▶│  ShadowSync   │────────────────▶│ShadowTransport│
//!  (validate/apply)  │  (per thing)  │◀── status/delta │   (broker)    │
//!                    └───────────────┘    /timeout     └───────────────┘
//!
//!  outbox file ──▶ ┌──────────────────┐    publish    ┌────────────────┐
//!   (enqueue)      │ MessagePublisher │──────────────▶│MessageTransport│
//!                  │  DispatchQueue   │               │    (broker)    │
//!                  └──────────────────┘               └────────────────┘
//! ```
//!
//! The [`shadow::ShadowSync`] state machine reconciles a cloud-held shadow
//! document against local [`service::Service`] collaborators using the
//! [`document`] diff/merge algebra: cloud-desired changes are merged,
//! validated, applied, and the effective delta is reported back, with at
//! most one update in flight per thing.
//!
//! The [`publisher::MessagePublisher`] drains a directory-style outbox of
//! JSON message files through a [`queue::DispatchQueue`]: a priority path
//! with named dedup slots, a configurable-order bulk path, a concurrency
//! bound, and a jam alarm for stuck transports.
//!
//! Both halves consume narrow capability traits from [`transport`] rather
//! than talking to a broker directly, so they embed under any MQTT-like
//! stack (and under plain mocks in tests).
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use shadow_gateway::config::ShadowConfig;
//! use shadow_gateway::shadow::ShadowSync;
//! # use shadow_gateway::transport::{ShadowTransport, UpdateRequest, TransportError};
//! # use async_trait::async_trait;
//! # struct Mqtt;
//! # #[async_trait]
//! # impl ShadowTransport for Mqtt {
//! #     async fn get(&self, _: &str, _: &str) -> Result<(), TransportError> { Ok(()) }
//! #     async fn update(&self, _: &str, _: UpdateRequest) -> Result<(), TransportError> { Ok(()) }
//! # }
//! # struct NtpService;
//! # impl shadow_gateway::service::Service for NtpService {
//! #     fn current_config(&self) -> Option<serde_json::Value> { None }
//! # }
//!
//! # async fn demo() {
//! let transport: Arc<dyn ShadowTransport> = Arc::new(Mqtt);
//! let sync = Arc::new(
//!     ShadowSync::new("device-1", transport, ShadowConfig::default())
//!         .with_service("ntp", Arc::new(NtpService)),
//! );
//! sync.fetch().await;
//! # }
//! ```

pub mod config;
pub mod document;
pub mod heap;
pub mod publisher;
pub mod queue;
pub mod service;
pub mod shadow;
pub mod transport;

pub use config::{DispatchOrder, PublisherConfig, QueueConfig, ShadowConfig};
pub use document::{diff, merge, normalize, overlay, DeleteMode};
pub use publisher::{MessagePublisher, PublishError};
pub use queue::{DispatchQueue, QueueEntry, QueueEvent};
pub use service::{InitialDocumentSource, Service, ValidationError};
pub use shadow::{ShadowSync, SyncState};
pub use transport::{
    MessageTransport, PublishOptions, ShadowTransport, StatusOutcome, TransportError,
};
