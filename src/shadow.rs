// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-thing shadow synchronizer.
//!
//! A [`ShadowSync`] reconciles the cloud-held shadow document for one named
//! thing against the local truth held by its registered [`Service`]s. The
//! cloud's `desired` partition is merged onto each service's current
//! configuration, validated, applied, and the resulting changes are reported
//! back, coalesced through a two-slot pending-update buffer so at most one
//! update request is ever in flight per thing.
//!
//! # Lifecycle
//!
//! ```text
//! AwaitingInitialFetch ──fetch accepted / shadow missing──▶ Ready
//! ```
//!
//! Fetch and update failures are never fatal: both retry indefinitely on a
//! fixed delay. A missing shadow (first boot) bootstraps each service from
//! an optional [`InitialDocumentSource`] and creates the shadow from the
//! resulting reported state.
//!
//! Inbound transport events are delivered by the embedding layer through
//! [`ShadowSync::handle_status`], [`ShadowSync::handle_delta`] and
//! [`ShadowSync::handle_timeout`], routed by client token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ShadowConfig;
use crate::document::{diff, merge, normalize, DeleteMode};
use crate::service::{InitialDocumentSource, Service};
use crate::transport::{
    ShadowTransport, StatusOutcome, StatusResponse, UpdateRequest, NOT_FOUND,
};

/// Synchronization state of a thing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No shadow has been received yet; updates are buffered silently.
    AwaitingInitialFetch,
    /// The shadow has been reconciled at least once; updates flow.
    Ready,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AwaitingInitialFetch => write!(f, "AwaitingInitialFetch"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

/// The two-slot pending-update buffer: one payload in flight, one
/// accumulating further merges. A third arriving payload is merged into the
/// queued one, so the buffer never exceeds two slots.
#[derive(Debug)]
enum PendingUpdates {
    Empty,
    InFlight(Value),
    InFlightWithQueued(Value, Value),
}

impl PendingUpdates {
    /// Buffer a payload. Returns `true` when it became the head slot (i.e.
    /// nothing was in flight and this payload should be sent now).
    fn push(&mut self, payload: Value, mode: DeleteMode) -> bool {
        let (next, became_head) = match std::mem::replace(self, Self::Empty) {
            Self::Empty => (Self::InFlight(payload), true),
            Self::InFlight(head) => (Self::InFlightWithQueued(head, payload), false),
            Self::InFlightWithQueued(head, queued) => (
                Self::InFlightWithQueued(head, merge(queued, payload, mode)),
                false,
            ),
        };
        *self = next;
        became_head
    }

    fn head(&self) -> Option<&Value> {
        match self {
            Self::Empty => None,
            Self::InFlight(head) | Self::InFlightWithQueued(head, _) => Some(head),
        }
    }

    /// Drop the in-flight payload. Returns `true` when a queued payload
    /// moved up and should be sent next.
    fn pop(&mut self) -> bool {
        match std::mem::replace(self, Self::Empty) {
            Self::Empty | Self::InFlight(_) => false,
            Self::InFlightWithQueued(_, queued) => {
                *self = Self::InFlight(queued);
                true
            }
        }
    }
}

struct ServiceEntry {
    key: String,
    service: Arc<dyn Service>,
    applied_once: AtomicBool,
}

struct SyncInner {
    state: SyncState,
    pending: PendingUpdates,
    fetch_retry: Option<JoinHandle<()>>,
}

/// Shadow synchronizer for a single thing.
pub struct ShadowSync {
    thing: String,
    token_fetch: String,
    token_update: String,
    transport: Arc<dyn ShadowTransport>,
    services: Vec<ServiceEntry>,
    defaults: Option<Arc<dyn InitialDocumentSource>>,
    config: ShadowConfig,
    mode: DeleteMode,
    inner: Mutex<SyncInner>,
}

impl ShadowSync {
    pub fn new(
        thing: impl Into<String>,
        transport: Arc<dyn ShadowTransport>,
        config: ShadowConfig,
    ) -> Self {
        let thing = thing.into();
        let mode = config.delete_mode();
        Self {
            token_fetch: format!("FETCH:{thing}"),
            token_update: format!("UPDATE:{thing}"),
            thing,
            transport,
            services: Vec::new(),
            defaults: None,
            config,
            mode,
            inner: Mutex::new(SyncInner {
                state: SyncState::AwaitingInitialFetch,
                pending: PendingUpdates::Empty,
                fetch_retry: None,
            }),
        }
    }

    /// Register a service under its fragment key.
    #[must_use]
    pub fn with_service(mut self, key: impl Into<String>, service: Arc<dyn Service>) -> Self {
        self.services.push(ServiceEntry {
            key: key.into(),
            service,
            applied_once: AtomicBool::new(false),
        });
        self
    }

    /// Provide initial documents for bootstrap on a missing shadow.
    #[must_use]
    pub fn with_initial_source(mut self, source: Arc<dyn InitialDocumentSource>) -> Self {
        self.defaults = Some(source);
        self
    }

    #[must_use]
    pub fn state(&self) -> SyncState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn thing(&self) -> &str {
        &self.thing
    }

    /// Request the shadow document. No-op for a thing without services.
    pub async fn fetch(self: &Arc<Self>) {
        if self.services.is_empty() {
            return;
        }
        if let Err(e) = self.transport.get(&self.thing, &self.token_fetch).await {
            warn!(thing = %self.thing, error = %e, "shadow fetch send failed");
            self.schedule_fetch_retry();
        }
    }

    /// Route a get/update status event by its client token.
    pub async fn handle_status(self: &Arc<Self>, token: &str, outcome: StatusOutcome) {
        if token == self.token_fetch {
            match outcome {
                StatusOutcome::Accepted(response) => self.on_fetch_accepted(response).await,
                StatusOutcome::Rejected { code } if code == NOT_FOUND => {
                    self.on_fetch_missing().await;
                }
                StatusOutcome::Rejected { code } => {
                    warn!(thing = %self.thing, code, "shadow fetch rejected");
                    self.schedule_fetch_retry();
                }
            }
        } else if token == self.token_update {
            match outcome {
                StatusOutcome::Accepted(_) => self.on_update_accepted().await,
                StatusOutcome::Rejected { code } => {
                    warn!(thing = %self.thing, code, "shadow update rejected, scheduling retry");
                    self.schedule_update_retry();
                }
            }
        } else {
            warn!(thing = %self.thing, token, "ignoring status with unexpected token");
        }
    }

    /// Handle a request timeout for the given client token.
    pub async fn handle_timeout(self: &Arc<Self>, token: &str) {
        if token == self.token_fetch {
            warn!(thing = %self.thing, "shadow fetch timed out, retrying");
            self.fetch().await;
        } else if token == self.token_update {
            warn!(thing = %self.thing, "shadow update timed out, scheduling retry");
            self.schedule_update_retry();
        } else {
            warn!(thing = %self.thing, token, "ignoring timeout with unexpected token");
        }
    }

    /// Buffer (and, when idle and ready, send) a reported-state update.
    /// `None` flushes whatever is buffered.
    pub async fn update(self: &Arc<Self>, payload: Option<Value>) {
        let to_send = {
            let mut inner = self.inner.lock();
            match payload {
                Some(p) => {
                    let became_head = inner.pending.push(p, self.mode);
                    if became_head && inner.state == SyncState::Ready {
                        inner.pending.head().cloned()
                    } else {
                        // Queued behind the in-flight payload, or buffered
                        // silently while awaiting the initial fetch
                        None
                    }
                }
                None => {
                    if inner.state == SyncState::Ready {
                        if inner.pending.head().is_none() {
                            debug!(thing = %self.thing, "surplus update request, nothing pending");
                        }
                        inner.pending.head().cloned()
                    } else {
                        None
                    }
                }
            }
        };
        if let Some(state) = to_send {
            self.send_update(state).await;
        }
    }

    /// Apply a remote delta (cloud-desired change) to the affected services
    /// and report the outcome.
    pub async fn handle_delta(self: &Arc<Self>, delta: Value) {
        if self.services.is_empty() || delta.is_null() {
            return;
        }
        let Value::Object(delta) = delta else {
            warn!(thing = %self.thing, "ignoring non-object delta");
            return;
        };
        info!(thing = %self.thing, "received delta");
        let mut upd = Map::new();
        for (key, fragment) in delta {
            match self.services.iter().find(|e| e.key == key) {
                Some(entry) => {
                    let ack = normalize(fragment.clone(), self.mode);
                    if let Some(change) = self.reconcile_fragment(entry, fragment) {
                        if !entry.service.ephemeral_data() {
                            // Report the effective change, or just acknowledge
                            // the delta when local state already matched
                            upd.insert(key, change.unwrap_or(ack));
                        }
                    }
                }
                None => {
                    // No service for this fragment: acknowledge it anyway so
                    // the cloud stops re-sending the delta
                    upd.insert(key, normalize(fragment, self.mode));
                }
            }
        }
        if !upd.is_empty() {
            self.update(Some(json!({"reported": Value::Object(upd), "desired": null})))
                .await;
        }
    }

    /// Apply a locally-produced change for one service and report it. The
    /// local path never touches the `desired` partition.
    pub async fn handle_local_delta(self: &Arc<Self>, service: &str, change: Value) {
        let Some(entry) = self.services.iter().find(|e| e.key == service) else {
            warn!(thing = %self.thing, service, "local delta for unknown service");
            return;
        };
        debug!(thing = %self.thing, service, "applying local delta");
        if let Some(Some(change)) = self.reconcile_fragment(entry, change) {
            if !entry.service.ephemeral_data() {
                let mut fragments = Map::new();
                fragments.insert(service.to_string(), change);
                self.update(Some(json!({"reported": Value::Object(fragments)})))
                    .await;
            }
        }
    }

    async fn on_fetch_accepted(self: &Arc<Self>, response: StatusResponse) {
        info!(thing = %self.thing, "received shadow");
        self.cancel_fetch_retry();
        let reported = response.state.reported.unwrap_or(Value::Null);
        let desired = response.state.desired.unwrap_or(Value::Null);

        let mut upd = Map::new();
        for entry in &self.services {
            let reported_fragment = reported.get(&entry.key).cloned().unwrap_or(Value::Null);
            let desired_fragment = desired.get(&entry.key).filter(|v| !v.is_null());

            if let Some(desired_fragment) = desired_fragment {
                let candidate =
                    merge(reported_fragment.clone(), desired_fragment.clone(), self.mode);
                let Some(validated) = self.validate_fragment(entry, candidate) else {
                    continue;
                };
                if !self.apply_fragment(entry, &validated) {
                    continue;
                }
                if !entry.service.ephemeral_data() {
                    if let Some(change) = diff(&reported_fragment, &validated, self.mode) {
                        upd.insert(entry.key.clone(), change);
                    }
                }
            } else if !entry.service.ephemeral_data() {
                // Local-wrote-but-never-confirmed: the reported partition
                // lags the service's actual configuration
                if let Some(current) = entry.service.current_config() {
                    if let Some(change) = diff(&reported_fragment, &current, self.mode) {
                        upd.insert(entry.key.clone(), change);
                    }
                }
            }
        }

        {
            let mut inner = self.inner.lock();
            if !upd.is_empty() {
                inner.pending.push(
                    json!({"reported": Value::Object(upd), "desired": null}),
                    self.mode,
                );
            }
            inner.state = SyncState::Ready;
        }
        // Nothing was in flight before Ready, so the buffer head (a payload
        // buffered while awaiting the fetch, or the reconciliation above)
        // has never been sent; flush it now.
        self.update(None).await;
    }

    async fn on_fetch_missing(self: &Arc<Self>) {
        warn!(thing = %self.thing, "no shadow exists yet, creating one");
        self.cancel_fetch_retry();

        let mut reported = Map::new();
        for entry in &self.services {
            let initial = self
                .defaults
                .as_ref()
                .and_then(|source| source.initial_document(&entry.key))
                .or_else(|| entry.service.current_config())
                .unwrap_or_else(|| json!({}));
            let Some(validated) = self.validate_fragment(entry, normalize(initial, self.mode))
            else {
                continue;
            };
            if !self.apply_fragment(entry, &validated) {
                continue;
            }
            if !entry.service.ephemeral_data() {
                reported.insert(entry.key.clone(), validated);
            }
        }

        {
            let mut inner = self.inner.lock();
            // Seat the create-shadow payload in the buffer so the update
            // retry path can re-drive it until the cloud accepts it.
            inner
                .pending
                .push(json!({"reported": Value::Object(reported)}), self.mode);
            inner.state = SyncState::Ready;
        }
        self.update(None).await;
    }

    async fn on_update_accepted(self: &Arc<Self>) {
        info!(thing = %self.thing, "shadow updated");
        let has_next = self.inner.lock().pending.pop();
        if has_next {
            self.update(None).await;
        }
    }

    async fn send_update(self: &Arc<Self>, state: Value) {
        let request = UpdateRequest {
            token: self.token_update.clone(),
            payload: state,
        };
        if let Err(e) = self.transport.update(&self.thing, request).await {
            warn!(thing = %self.thing, error = %e, "shadow update send failed, scheduling retry");
            self.schedule_update_retry();
        }
    }

    /// Merge an incoming fragment onto the service's current configuration,
    /// validate and apply it.
    ///
    /// Returns `None` when the fragment was dropped (validation or apply
    /// failure), `Some(change)` otherwise, where `change` is the diff
    /// against the pre-merge configuration (`None` for no effective change).
    #[allow(clippy::option_option)]
    fn reconcile_fragment(&self, entry: &ServiceEntry, incoming: Value) -> Option<Option<Value>> {
        let current = entry.service.current_config().unwrap_or_else(|| json!({}));
        let candidate = merge(current.clone(), incoming, self.mode);
        let validated = self.validate_fragment(entry, candidate)?;
        if !self.apply_fragment(entry, &validated) {
            return None;
        }
        Some(diff(&current, &validated, self.mode))
    }

    fn validate_fragment(&self, entry: &ServiceEntry, candidate: Value) -> Option<Value> {
        match entry.service.validate(candidate) {
            Ok(validated) => Some(validated),
            Err(e) => {
                // Dropped entirely; local and reported state stay unchanged
                warn!(
                    thing = %self.thing,
                    service = %entry.key,
                    error = %e,
                    "service rejected configuration, dropping fragment"
                );
                None
            }
        }
    }

    /// Write out and notify per the service contract. A validation failure
    /// never reaches here, so the first-apply flag is only consumed for
    /// configurations the service accepted.
    fn apply_fragment(&self, entry: &ServiceEntry, validated: &Value) -> bool {
        let initial = !entry.applied_once.swap(true, Ordering::SeqCst);
        let current = entry.service.current_config();
        let changed = current.as_ref() != Some(validated);
        if changed {
            if !entry.service.write_out(validated) {
                warn!(thing = %self.thing, service = %entry.key, "service write_out failed");
                return false;
            }
        }
        if changed || (initial && entry.service.initial_notify()) {
            info!(thing = %self.thing, service = %entry.key, "notifying service");
            entry.service.notify();
        } else {
            debug!(thing = %self.thing, service = %entry.key, "no changes for service");
        }
        true
    }

    fn schedule_fetch_retry(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.fetch_retry.is_some() {
            warn!(thing = %self.thing, "shadow fetch failed, retry already pending");
            return;
        }
        warn!(thing = %self.thing, "shadow fetch failed, scheduling retry");
        let this = Arc::clone(self);
        let delay = Duration::from_millis(self.config.fetch_retry_ms);
        inner.fetch_retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.inner.lock().fetch_retry = None;
            this.fetch().await;
        }));
    }

    fn cancel_fetch_retry(&self) {
        if let Some(timer) = self.inner.lock().fetch_retry.take() {
            timer.abort();
        }
    }

    fn schedule_update_retry(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let delay = Duration::from_millis(self.config.update_retry_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.update(None).await;
        });
    }
}
