//! Online/offline state with edge-triggered change notification.

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Current network reachability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn is_online(self) -> bool {
        matches!(self, Connectivity::Online)
    }
}

impl From<bool> for Connectivity {
    fn from(online: bool) -> Self {
        if online {
            Connectivity::Online
        } else {
            Connectivity::Offline
        }
    }
}

/// Shared connectivity state; clones observe and drive the same state
#[derive(Clone)]
pub struct ConnectivityMonitor {
    state: Arc<watch::Sender<Connectivity>>,
}

impl ConnectivityMonitor {
    pub fn new(initial: Connectivity) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            state: Arc::new(state),
        }
    }

    /// Synchronous query of the current state
    pub fn current(&self) -> Connectivity {
        *self.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current().is_online()
    }

    /// Record a platform observation; notifies subscribers only on a transition.
    /// Returns whether the state changed.
    pub fn set(&self, connectivity: Connectivity) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == connectivity {
                false
            } else {
                *current = connectivity;
                true
            }
        });

        if changed {
            info!(connectivity = ?connectivity, "Connectivity changed");
        }
        changed
    }

    /// Raw change stream
    pub fn watch(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }

    /// Run `handler` for every transition until the returned subscription is dropped.
    ///
    /// The handler is awaited before the next notification is delivered, so
    /// transitions that happen while it runs collapse into the latest state.
    pub fn subscribe<F, Fut>(&self, mut handler: F) -> Subscription
    where
        F: FnMut(Connectivity) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut changes = self.state.subscribe();
        let task = tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let connectivity = *changes.borrow_and_update();
                handler(connectivity).await;
            }
        });

        Subscription { task: Some(task) }
    }
}

/// Handle returned by [`ConnectivityMonitor::subscribe`]; detaches on drop
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Feeds a monitor from periodic TCP reachability checks of the upload host.
///
/// Only TCP reachability is observed. A host that accepts connections but
/// answers 502/503/504 stays online, so items queued by those responses wait
/// for the next transition, a manual drain or a restart.
pub struct ReachabilityProbe {
    target: String,
    interval: Duration,
    timeout: Duration,
}

impl ReachabilityProbe {
    /// Probe the host and port of `endpoint_url`
    pub fn for_endpoint(
        endpoint_url: &str,
        interval: Duration,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let url = reqwest::Url::parse(endpoint_url)?;
        let host = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("endpoint URL has no host: {endpoint_url}"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| anyhow::anyhow!("endpoint URL has no port: {endpoint_url}"))?;

        Ok(Self {
            target: format!("{host}:{port}"),
            interval,
            timeout,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Single reachability check
    pub async fn check(&self) -> Connectivity {
        match tokio::time::timeout(self.timeout, TcpStream::connect(&self.target)).await {
            Ok(Ok(_)) => Connectivity::Online,
            Ok(Err(e)) => {
                debug!(target = %self.target, error = %e, "Endpoint unreachable");
                Connectivity::Offline
            }
            Err(_) => {
                debug!(target = %self.target, "Reachability check timed out");
                Connectivity::Offline
            }
        }
    }

    /// Probe until `shutdown` is cancelled
    pub fn spawn(self, monitor: ConnectivityMonitor, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(target = %self.target, interval = ?self.interval, "Starting reachability probe");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let observed = self.check().await;
                        if monitor.set(observed) && !observed.is_online() {
                            warn!(target = %self.target, "Upload endpoint went offline");
                        }
                    }
                }
            }

            debug!(target = %self.target, "Reachability probe stopped");
        })
    }
}
