// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Service collaborators: the local consumers of shadow fragments.
//!
//! Each service owns one top-level fragment of a thing's shadow document,
//! keyed by the fragment name it is registered under. The synchronizer
//! pulls the service's current configuration on demand, asks it to validate
//! merged candidates, and applies accepted configurations through
//! `write_out`/`notify`.
//!
//! All behavior beyond `current_config` is optional; default
//! implementations make a service accept-everything, persist-nothing. The
//! two flags modify synchronizer behavior:
//!
//! - `ephemeral_data`: the fragment is apply-only and never diffed or
//!   reported back to the cloud.
//! - `initial_notify`: `notify` fires on the first-ever apply even when the
//!   configuration did not change.

use serde_json::Value;
use thiserror::Error;

/// A service rejected a candidate configuration.
///
/// Validation failures are local policy: the synchronizer logs them and
/// drops the offending fragment without altering any state.
#[derive(Debug, Error)]
#[error("validation rejected: {0}")]
pub struct ValidationError(pub String);

/// A named fragment consumer.
pub trait Service: Send + Sync {
    /// The service's current local configuration, or `None` if it has none
    /// (e.g. its backing file does not exist yet).
    fn current_config(&self) -> Option<Value>;

    /// Vet (and possibly rewrite) a candidate configuration before it is
    /// applied or reported.
    fn validate(&self, candidate: Value) -> Result<Value, ValidationError> {
        Ok(candidate)
    }

    /// Persist/apply a validated configuration. Returns `false` on failure,
    /// in which case the fragment is neither notified nor reported. May be
    /// a no-op for services with nothing to persist.
    fn write_out(&self, config: &Value) -> bool {
        let _ = config;
        true
    }

    /// Side effect fired after a successful apply (e.g. poke a daemon).
    fn notify(&self) {}

    /// Apply-only fragment: never diffed or reported back.
    fn ephemeral_data(&self) -> bool {
        false
    }

    /// Fire `notify` on the first-ever apply even with no change.
    fn initial_notify(&self) -> bool {
        false
    }
}

/// Optional collaborator producing a service's very first configuration
/// when no shadow exists yet (bootstrap on a missing shadow).
pub trait InitialDocumentSource: Send + Sync {
    /// The initial document for `service`, or `None` to fall back to the
    /// service's current local configuration.
    fn initial_document(&self, service: &str) -> Option<Value>;
}
