//! Connectivity detection.
//!
//! Raw connectivity reports come from the platform (or from a
//! [`LivenessProbe`] pinging a known endpoint) and are fed to a
//! [`ConnectivityMonitor`]. The monitor only publishes a state once it has
//! held for the debounce window, which keeps a flapping link from starting
//! and aborting queue drains in a loop.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use harbor_core::{ErrorClass, config::ProbeConfig};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::listeners::{ListenerRegistry, Subscription};
use crate::transport::{Request, Transport};

/// The published connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectivityState {
    pub is_online: bool,
    /// When the last published transition happened. `None` until the first one.
    pub last_transition_at: Option<DateTime<Utc>>,
    pub last_online_at: Option<DateTime<Utc>>,
    pub last_offline_at: Option<DateTime<Utc>>,
}

impl ConnectivityState {
    fn initial(is_online: bool) -> Self {
        let now = Utc::now();
        Self {
            is_online,
            last_transition_at: None,
            last_online_at: is_online.then_some(now),
            last_offline_at: (!is_online).then_some(now),
        }
    }
}

/// Source of connectivity information for the worker and controller.
pub trait NetworkProbe: Send + Sync {
    fn is_online(&self) -> bool {
        self.state().is_online
    }

    fn state(&self) -> ConnectivityState;

    /// Called on every published transition.
    fn on_change(&self, callback: Box<dyn Fn(&ConnectivityState) + Send + Sync>) -> Subscription;

    /// Receiver for async waiters. Only sees published (debounced) states.
    fn watch(&self) -> watch::Receiver<ConnectivityState>;
}

struct MonitorInner {
    debounce: Duration,
    tx: watch::Sender<ConnectivityState>,
    listeners: ListenerRegistry<ConnectivityState>,
    /// Bumped on every raw report; a pending publish only lands if no newer
    /// report arrived during its window.
    generation: Mutex<u64>,
}

impl MonitorInner {
    fn publish(&self, is_online: bool) {
        let mut published = None;
        self.tx.send_if_modified(|state| {
            if state.is_online == is_online {
                return false;
            }
            let now = Utc::now();
            state.is_online = is_online;
            state.last_transition_at = Some(now);
            if is_online {
                state.last_online_at = Some(now);
            } else {
                state.last_offline_at = Some(now);
            }
            published = Some(*state);
            true
        });

        if let Some(state) = published {
            tracing::info!(is_online, "connectivity changed");
            self.listeners.notify(&state);
        }
    }
}

/// Debounced connectivity state fed by raw reports.
///
/// Cloning is cheap and shares the state.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    inner: Arc<MonitorInner>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool, debounce: Duration) -> Self {
        let (tx, _rx) = watch::channel(ConnectivityState::initial(initially_online));
        Self { inner: Arc::new(MonitorInner { debounce, tx, listeners: ListenerRegistry::new(), generation: Mutex::new(0) }) }
    }

    pub fn from_config(initially_online: bool, config: &ProbeConfig) -> Self {
        Self::new(initially_online, config.debounce())
    }

    /// Feed a raw connectivity observation.
    ///
    /// With a zero debounce the state is published before this returns.
    /// Otherwise publication is deferred on the tokio runtime and happens
    /// only if no other report arrives within the window.
    pub fn report(&self, is_online: bool) {
        let generation = {
            let mut generation = self.inner.generation.lock().unwrap_or_else(PoisonError::into_inner);
            *generation += 1;
            *generation
        };

        if self.inner.debounce.is_zero() {
            self.inner.publish(is_online);
            return;
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            let current = *inner.generation.lock().unwrap_or_else(PoisonError::into_inner);
            if current == generation {
                inner.publish(is_online);
            } else {
                tracing::debug!(is_online, "connectivity report superseded within debounce window");
            }
        });
    }

    pub fn debounce(&self) -> Duration {
        self.inner.debounce
    }
}

impl NetworkProbe for ConnectivityMonitor {
    fn state(&self) -> ConnectivityState {
        *self.inner.tx.borrow()
    }

    fn on_change(&self, callback: Box<dyn Fn(&ConnectivityState) + Send + Sync>) -> Subscription {
        self.inner.listeners.subscribe(callback)
    }

    fn watch(&self) -> watch::Receiver<ConnectivityState> {
        self.inner.tx.subscribe()
    }
}

/// Periodic reachability check against a known endpoint.
///
/// Any HTTP answer, even an error status, proves the network path works. Only
/// network-class failures report offline.
pub struct LivenessProbe {
    transport: Arc<dyn Transport>,
    url: String,
    interval: Duration,
    monitor: ConnectivityMonitor,
}

impl LivenessProbe {
    pub fn new(transport: Arc<dyn Transport>, url: impl Into<String>, interval: Duration, monitor: ConnectivityMonitor) -> Self {
        Self { transport, url: url.into(), interval, monitor }
    }

    /// Ping once and report the result to the monitor.
    pub async fn check(&self) -> bool {
        let reachable = match self.transport.send(&Request::new("HEAD", self.url.as_str())).await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "liveness check failed");
                e.class() != ErrorClass::Network
            }
        };
        self.monitor.report(reachable);
        reachable
    }

    /// Run [`check`](Self::check) every interval until the task is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(url = %self.url, interval_ms = self.interval.as_millis() as u64, "starting liveness probe");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.check().await;
            }
        })
    }
}
