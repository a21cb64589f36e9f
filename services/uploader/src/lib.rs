//! Media Uploader
//!
//! Offline-durable upload queue for captured media. Files submitted while the
//! upload endpoint is unreachable are persisted locally and replayed, oldest
//! first, once connectivity returns.
//!
//! ## Features
//!
//! - **Durable queue**: the whole queue is persisted to SQLite after every
//!   mutation and survives restarts
//! - **Single-flight drain**: reconnect signals are coalesced so at most one
//!   replay pass is ever in flight
//! - **Failure classification**: network failures are queued and retried,
//!   rejections are reported once and dropped, whether the file was sent
//!   directly or replayed from the queue
//! - **Submission API**: local HTTP API for submitting files and inspecting
//!   the queue
//!
//! ## Architecture
//!
//! ```text
//!  Submission API          Reachability Probe
//! ┌──────────────┐        ┌──────────────┐
//! │ POST         │        │ TCP check of │
//! │ /api/v1/     │        │ endpoint host│
//! │   uploads    │        └──────────────┘
//! └──────────────┘               │
//!        │                       ▼
//!        │                ┌──────────────┐
//!        │                │ Connectivity │
//!        │                │ Monitor      │
//!        │                └──────────────┘
//!        ▼                       │ online
//! ┌──────────────┐◀──────────────┘
//! │ Queue        │          ┌──────────────┐
//! │ Engine       │─────────▶│ HTTP         │──▶ upload endpoint
//! └──────────────┘          │ Transport    │
//!        │                  └──────────────┘
//!        ▼
//! ┌──────────────┐
//! │ SQLite       │
//! │ kv_store     │
//! └──────────────┘
//! ```

pub mod api;
pub mod config;
pub mod connectivity;
pub mod engine;
pub mod record;
pub mod status;
pub mod store;
pub mod transport;

pub use api::{start_api_server, AppState};
pub use config::Config;
pub use connectivity::{Connectivity, ConnectivityMonitor, ReachabilityProbe, Subscription};
pub use engine::{DrainOutcome, QueueEngine, SubmitOutcome};
pub use record::{MediaRecord, RecordId, Upload};
pub use status::{EngineStatus, FailureKind, Phase, StatusEvent};
pub use store::{DurableStore, MemoryStore, SqliteStore, StoreError};
pub use transport::{HttpTransport, TransportError, UploadReceipt, UploadTransport};
