//! Queue engine: the single authority over sending now versus queueing, and
//! over replaying the queue when connectivity returns.
//!
//! Submission:
//! - online with no backlog: direct upload; network-class failures fall back
//!   to the queue, rejections are terminal and never persisted
//! - offline, or behind an existing backlog: append and persist
//!
//! Drain (one pass at a time):
//! - replay records head first, removing and persisting after each success
//! - stop at the first network-class failure and leave the queue untouched;
//!   the next reconnect retries from the same head
//! - a rejected record is removed and reported, then the pass stops
//! - a record whose payload cannot be rebuilt is reported and skipped for the
//!   current pass; it keeps its place in the queue

use crate::connectivity::{Connectivity, ConnectivityMonitor, Subscription};
use crate::record::{IdGenerator, MediaRecord, RecordId, Upload};
use crate::status::{self, EngineStatus, FailureKind, Phase, StatusEvent};
use crate::store::{DurableStore, StoreError};
use crate::transport::{TransportError, UploadReceipt, UploadTransport};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

const EVENT_CAPACITY: usize = 256;

/// Final state of one submission
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Uploaded directly
    Delivered { id: RecordId, receipt: UploadReceipt },
    /// Appended to the offline queue; `persisted` is false when the durable
    /// store refused the write and the item only lives in memory
    Queued { id: RecordId, persisted: bool },
    /// Terminal failure; never queued
    Failed { id: RecordId, reason: FailureKind },
}

impl SubmitOutcome {
    pub fn id(&self) -> RecordId {
        match self {
            SubmitOutcome::Delivered { id, .. }
            | SubmitOutcome::Queued { id, .. }
            | SubmitOutcome::Failed { id, .. } => *id,
        }
    }
}

/// Result of a drain request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DrainOutcome {
    /// Nothing was queued
    Idle,
    /// Offline; the queue was left as is
    Blocked { delivered: usize, pending: usize },
    /// Every decodable record was delivered; `skipped` undecodable ones remain
    Completed { delivered: usize, skipped: usize },
    /// Stopped at the first failed delivery
    Stopped {
        delivered: usize,
        remaining: usize,
        reason: FailureKind,
    },
    /// Another pass was in flight and will re-check the queue when it ends
    Coalesced,
}

/// Owns the upload queue and coordinates store, transport and connectivity
pub struct QueueEngine {
    queue: Mutex<Vec<MediaRecord>>,
    store: Arc<dyn DurableStore>,
    transport: Arc<dyn UploadTransport>,
    connectivity: ConnectivityMonitor,
    ids: IdGenerator,
    draining: AtomicBool,
    drain_requested: AtomicBool,
    events: broadcast::Sender<StatusEvent>,
    status: watch::Sender<EngineStatus>,
}

impl QueueEngine {
    /// Load the persisted queue and build the engine around it
    pub async fn open(
        store: Arc<dyn DurableStore>,
        transport: Arc<dyn UploadTransport>,
        connectivity: ConnectivityMonitor,
    ) -> Result<Self, StoreError> {
        let queue = store.load().await?;

        let ids = IdGenerator::new();
        if let Some(max) = queue.iter().map(|r| r.id).max() {
            ids.observe(max);
        }

        info!(pending = queue.len(), "Upload queue loaded");
        metrics::gauge!("uploader.queue.pending").set(queue.len() as f64);

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (status, _) = watch::channel(EngineStatus::idle(queue.len(), connectivity.current()));

        Ok(Self {
            queue: Mutex::new(queue),
            store,
            transport,
            connectivity,
            ids,
            draining: AtomicBool::new(false),
            drain_requested: AtomicBool::new(false),
            events,
            status,
        })
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// Number of records waiting for delivery
    pub async fn pending(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Copy of the queue in delivery order
    pub async fn snapshot(&self) -> Vec<MediaRecord> {
        self.queue.lock().await.clone()
    }

    /// Current status surface
    pub fn status(&self) -> EngineStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<EngineStatus> {
        self.status.subscribe()
    }

    /// Per-record progress events for every submission and replay
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Submit captured media: upload now when possible, otherwise queue it
    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len(), content_type = %content_type))]
    pub async fn submit(
        &self,
        bytes: Vec<u8>,
        content_type: &str,
        filename: Option<&str>,
    ) -> SubmitOutcome {
        let now = Utc::now();
        let upload = Upload::new(self.ids.next(now), bytes, content_type, filename);
        let id = upload.id;
        metrics::counter!("uploader.submissions").increment(1);

        if upload.bytes.is_empty() {
            self.fail(id, &upload.filename, FailureKind::Empty, status::NO_FILE_MSG.to_string())
                .await;
            return SubmitOutcome::Failed {
                id,
                reason: FailureKind::Empty,
            };
        }

        if let Err(e) = upload.validate() {
            warn!(record_id = %id, error = %e, "Submission cannot be rebuilt as an upload");
            let message = status::failed_msg(&upload.filename, FailureKind::Encoding);
            self.fail(id, &upload.filename, FailureKind::Encoding, message)
                .await;
            return SubmitOutcome::Failed {
                id,
                reason: FailureKind::Encoding,
            };
        }

        self.emit(StatusEvent::Attempting {
            id,
            filename: upload.filename.clone(),
        });
        self.set_status(
            Phase::Attempting,
            status::attempting_msg(&upload.filename),
            self.pending().await,
        );

        if !self.connectivity.is_online() {
            debug!(record_id = %id, "Offline, queueing submission");
            return self.enqueue(upload, now).await;
        }

        if self.has_backlog().await {
            debug!(record_id = %id, "Backlog present, queueing behind it");
            return self.enqueue(upload, now).await;
        }

        match self.transport.send(&upload).await {
            Ok(receipt) => {
                metrics::counter!("uploader.records.delivered").increment(1);
                let message = match &receipt.filename {
                    Some(stored_as) => format!("{}: {}", status::DELIVERED_MSG, stored_as),
                    None => status::DELIVERED_MSG.to_string(),
                };
                self.emit(StatusEvent::Delivered {
                    id,
                    filename: upload.filename.clone(),
                    stored_as: receipt.filename.clone(),
                });
                self.set_status(Phase::Delivered, message, self.pending().await);
                SubmitOutcome::Delivered { id, receipt }
            }
            Err(e @ TransportError::InvalidPayload(_)) => {
                warn!(record_id = %id, error = %e, "Submission cannot be rebuilt as an upload");
                let message = status::failed_msg(&upload.filename, FailureKind::Encoding);
                self.fail(id, &upload.filename, FailureKind::Encoding, message)
                    .await;
                SubmitOutcome::Failed {
                    id,
                    reason: FailureKind::Encoding,
                }
            }
            Err(e) if e.is_network() || !self.connectivity.is_online() => {
                warn!(record_id = %id, error = %e, "Direct upload failed on the network, queueing");
                self.enqueue(upload, now).await
            }
            Err(e) => {
                warn!(record_id = %id, error = %e, "Direct upload rejected");
                metrics::counter!("uploader.records.rejected").increment(1);
                let message = status::failed_msg(&upload.filename, FailureKind::Rejected);
                self.fail(id, &upload.filename, FailureKind::Rejected, message)
                    .await;
                SubmitOutcome::Failed {
                    id,
                    reason: FailureKind::Rejected,
                }
            }
        }
    }

    /// Replay the queue through the transport.
    ///
    /// Requests arriving while a pass is running are coalesced: the running
    /// pass re-checks the queue once more before it gives up the guard.
    pub async fn drain(&self) -> DrainOutcome {
        self.drain_requested.store(true, Ordering::SeqCst);
        if self.draining.swap(true, Ordering::SeqCst) {
            debug!("Drain already in progress, request coalesced");
            return DrainOutcome::Coalesced;
        }

        let mut outcome = DrainOutcome::Idle;
        loop {
            self.drain_requested.store(false, Ordering::SeqCst);
            let pass = self.drain_pass().await;
            if pass != DrainOutcome::Idle {
                outcome = pass;
            }
            self.draining.store(false, Ordering::SeqCst);

            if !self.drain_requested.load(Ordering::SeqCst)
                || self.draining.swap(true, Ordering::SeqCst)
            {
                return outcome;
            }
            debug!("Running coalesced drain request");
        }
    }

    /// Drain on every reconnect until the returned subscription is dropped
    pub fn watch_connectivity(self: &Arc<Self>) -> Subscription {
        let engine = Arc::clone(self);
        self.connectivity.subscribe(move |connectivity| {
            let engine = Arc::clone(&engine);
            async move {
                match connectivity {
                    Connectivity::Online => {
                        let outcome = engine.drain().await;
                        debug!(outcome = ?outcome, "Reconnect drain finished");
                    }
                    Connectivity::Offline => engine.mark_offline().await,
                }
            }
        })
    }

    #[instrument(skip(self))]
    async fn drain_pass(&self) -> DrainOutcome {
        let pending = self.pending().await;
        if pending == 0 {
            return DrainOutcome::Idle;
        }

        if !self.connectivity.is_online() {
            info!(pending, "Drain requested while offline");
            self.set_status(Phase::Queued, status::STILL_OFFLINE_MSG, pending);
            return DrainOutcome::Blocked {
                delivered: 0,
                pending,
            };
        }

        info!(pending, "Draining offline queue");
        metrics::counter!("uploader.drain.passes").increment(1);
        self.set_status(Phase::Draining, status::DRAINING_MSG, pending);

        let mut delivered = 0;
        let mut skipped: Vec<RecordId> = Vec::new();

        loop {
            let next = {
                let queue = self.queue.lock().await;
                queue.iter().find(|r| !skipped.contains(&r.id)).cloned()
            };
            let Some(record) = next else {
                break;
            };

            if !self.connectivity.is_online() {
                let pending = self.pending().await;
                info!(delivered, pending, "Connectivity lost, pausing drain");
                self.set_status(Phase::Queued, status::STILL_OFFLINE_MSG, pending);
                return DrainOutcome::Blocked { delivered, pending };
            }

            let upload = match record.to_upload() {
                Ok(upload) => upload,
                Err(e) => {
                    self.report_unreadable(&record, &e);
                    skipped.push(record.id);
                    continue;
                }
            };

            self.emit(StatusEvent::Attempting {
                id: record.id,
                filename: record.filename.clone(),
            });

            match self.transport.send(&upload).await {
                Ok(receipt) => {
                    let pending = self.remove_delivered(record.id).await;
                    delivered += 1;
                    metrics::counter!("uploader.records.delivered").increment(1);
                    self.emit(StatusEvent::Delivered {
                        id: record.id,
                        filename: record.filename.clone(),
                        stored_as: receipt.filename,
                    });
                    self.set_status(Phase::Draining, status::uploaded_msg(&record.filename), pending);
                }
                Err(e @ TransportError::InvalidPayload(_)) => {
                    self.report_unreadable(&record, &e);
                    skipped.push(record.id);
                }
                Err(e) if e.is_network() => {
                    warn!(
                        record_id = %record.id,
                        error = %e,
                        delivered,
                        "Replay failed, stopping drain until the next reconnect"
                    );
                    metrics::counter!("uploader.drain.stopped").increment(1);
                    self.emit(StatusEvent::Failed {
                        id: record.id,
                        filename: record.filename.clone(),
                        reason: FailureKind::Network,
                    });
                    let remaining = self.pending().await;
                    self.set_status(Phase::Failed, status::retry_msg(&record.filename), remaining);
                    return DrainOutcome::Stopped {
                        delivered,
                        remaining,
                        reason: FailureKind::Network,
                    };
                }
                Err(e) => {
                    // terminal: drop it so it is never sent again
                    let remaining = self.remove_delivered(record.id).await;
                    warn!(
                        record_id = %record.id,
                        error = %e,
                        delivered,
                        remaining,
                        "Queued upload rejected and removed, stopping drain"
                    );
                    metrics::counter!("uploader.records.rejected").increment(1);
                    metrics::counter!("uploader.drain.stopped").increment(1);
                    self.emit(StatusEvent::Failed {
                        id: record.id,
                        filename: record.filename.clone(),
                        reason: FailureKind::Rejected,
                    });
                    self.set_status(
                        Phase::Failed,
                        status::failed_msg(&record.filename, FailureKind::Rejected),
                        remaining,
                    );
                    return DrainOutcome::Stopped {
                        delivered,
                        remaining,
                        reason: FailureKind::Rejected,
                    };
                }
            }
        }

        let pending = self.pending().await;
        if skipped.is_empty() {
            info!(delivered, "Offline queue drained");
            self.set_status(Phase::Idle, status::DRAINED_MSG, pending);
        } else {
            warn!(delivered, skipped = skipped.len(), "Drain finished with unreadable records left in the queue");
            self.set_status(
                Phase::Failed,
                format!(
                    "{} queued item(s) could not be read and were kept in the queue.",
                    skipped.len()
                ),
                pending,
            );
        }

        DrainOutcome::Completed {
            delivered,
            skipped: skipped.len(),
        }
    }

    /// Append to the queue and persist the whole snapshot
    async fn enqueue(&self, upload: Upload, created_at: DateTime<Utc>) -> SubmitOutcome {
        let id = upload.id;
        let filename = upload.filename.clone();
        let record = upload.into_record(created_at);

        let (pending, persisted) = {
            let mut queue = self.queue.lock().await;
            queue.push(record);
            let persisted = self.persist(&queue).await;
            (queue.len(), persisted)
        };

        metrics::counter!("uploader.records.enqueued").increment(1);
        info!(record_id = %id, pending, persisted, "Record queued");

        self.emit(StatusEvent::Queued {
            id,
            filename,
            persisted,
        });
        let message = if persisted {
            status::QUEUED_MSG
        } else {
            status::QUEUED_AT_RISK_MSG
        };
        self.set_status(Phase::Queued, message, pending);

        SubmitOutcome::Queued { id, persisted }
    }

    /// Drop a delivered or rejected record and persist; returns the remaining count
    async fn remove_delivered(&self, id: RecordId) -> usize {
        let mut queue = self.queue.lock().await;
        if let Some(position) = queue.iter().position(|r| r.id == id) {
            queue.remove(position);
        }
        self.persist(&queue).await;
        queue.len()
    }

    /// Write the snapshot; on failure memory stays authoritative
    async fn persist(&self, queue: &[MediaRecord]) -> bool {
        metrics::gauge!("uploader.queue.pending").set(queue.len() as f64);

        match self.store.save(queue).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    error = %e,
                    records = queue.len(),
                    "Failed to persist upload queue, in-memory queue is authoritative"
                );
                metrics::counter!("uploader.store.failures").increment(1);
                false
            }
        }
    }

    fn report_unreadable(&self, record: &MediaRecord, error: &dyn std::error::Error) {
        error!(record_id = %record.id, error = %error, "Stored record is unreadable, skipping for this pass");
        metrics::counter!("uploader.records.undecodable").increment(1);
        self.emit(StatusEvent::Failed {
            id: record.id,
            filename: record.filename.clone(),
            reason: FailureKind::Encoding,
        });
    }

    async fn has_backlog(&self) -> bool {
        self.is_draining() || !self.queue.lock().await.is_empty()
    }

    async fn mark_offline(&self) {
        if self.is_draining() {
            return;
        }
        let pending = self.pending().await;
        let phase = if pending > 0 { Phase::Queued } else { Phase::Idle };
        self.set_status(phase, "Offline", pending);
    }

    async fn fail(&self, id: RecordId, filename: &str, reason: FailureKind, message: String) {
        self.emit(StatusEvent::Failed {
            id,
            filename: filename.to_string(),
            reason,
        });
        self.set_status(Phase::Failed, message, self.pending().await);
    }

    fn emit(&self, event: StatusEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_status(&self, phase: Phase, message: impl Into<String>, pending: usize) {
        self.status.send_replace(EngineStatus {
            phase,
            message: message.into(),
            pending,
            connectivity: self.connectivity.current(),
        });
    }
}
