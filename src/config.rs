//! Configuration for the gateway components.
//!
//! # Example
//!
//! ```
//! use shadow_gateway::config::{PublisherConfig, QueueConfig, DispatchOrder};
//!
//! // Minimal config (uses defaults)
//! let config = PublisherConfig::default();
//! assert_eq!(config.queue.concurrency, 10);
//! assert_eq!(config.max_retries, 2);
//!
//! // Full config
//! let config = PublisherConfig {
//!     queue: QueueConfig {
//!         concurrency: 4,
//!         order: DispatchOrder::OldestFirst,
//!         ..Default::default()
//!     },
//!     topic_prefix: "site/".into(),
//!     ..Default::default()
//! };
//! ```

use std::path::PathBuf;

use serde::Deserialize;

use crate::document::DeleteMode;

/// Bulk dispatch order for messages without an explicit priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchOrder {
    /// Ascending by item name.
    #[default]
    Lexical,
    /// Descending by item name.
    ReverseLexical,
    /// Largest timestamp first.
    NewestFirst,
    /// Smallest timestamp first.
    OldestFirst,
}

/// Dispatch queue configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Maximum number of concurrently dispatched items (default: 10)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Ordering policy for the bulk heap (default: lexical)
    #[serde(default)]
    pub order: DispatchOrder,

    /// How long the queue may sit fully saturated before a jam is raised
    /// (default: 5 minutes)
    #[serde(default = "default_jam_timeout_ms")]
    pub jam_timeout_ms: u64,
}

fn default_concurrency() -> usize { 10 }
fn default_jam_timeout_ms() -> u64 { 5 * 60 * 1000 }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            order: DispatchOrder::default(),
            jam_timeout_ms: default_jam_timeout_ms(),
        }
    }
}

/// Where the letterhead merged underneath each outbox message comes from.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LetterheadSource {
    /// Static JSON file, re-read for every message.
    File(PathBuf),
    /// Binary invoked per message; message metadata is passed in the
    /// environment and stdout is parsed as JSON.
    Generator(PathBuf),
}

/// Message publisher configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
    #[serde(flatten)]
    pub queue: QueueConfig,

    /// Publish attempts per message before the delivery is failed
    /// (default: 2)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Decoration prepended to every message topic
    #[serde(default)]
    pub topic_prefix: String,

    /// Decoration appended to every message topic
    #[serde(default)]
    pub topic_suffix: String,

    /// Optional letterhead source (default: empty letterhead)
    #[serde(default)]
    pub letterhead: Option<LetterheadSource>,
}

fn default_max_retries() -> u32 { 2 }

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            max_retries: default_max_retries(),
            topic_prefix: String::new(),
            topic_suffix: String::new(),
            letterhead: None,
        }
    }
}

/// Shadow synchronizer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ShadowConfig {
    /// Delay before retrying a failed shadow fetch (default: 5 s)
    #[serde(default = "default_fetch_retry_ms")]
    pub fetch_retry_ms: u64,

    /// Delay before retrying a failed shadow update (default: 3 s)
    #[serde(default = "default_update_retry_ms")]
    pub update_retry_ms: u64,

    /// Treat empty arrays as delete requests during normalization
    /// (default: off)
    #[serde(default)]
    pub empty_array_delete: bool,
}

fn default_fetch_retry_ms() -> u64 { 5 * 1000 }
fn default_update_retry_ms() -> u64 { 3 * 1000 }

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            fetch_retry_ms: default_fetch_retry_ms(),
            update_retry_ms: default_update_retry_ms(),
            empty_array_delete: false,
        }
    }
}

impl ShadowConfig {
    /// The normalization mode implied by this configuration.
    #[must_use]
    pub fn delete_mode(&self) -> DeleteMode {
        if self.empty_array_delete {
            DeleteMode::SentinelOrEmptyArray
        } else {
            DeleteMode::Sentinel
        }
    }
}
