//! Client side of harbor.
//!
//! Sends requests through a circuit breaker, caches successful GETs, queues
//! mutations while the upstream is unreachable, and replays the queue when
//! connectivity returns.

pub mod breaker;
pub mod controller;
pub mod listeners;
pub mod probe;
pub mod retry;
pub mod transport;
pub mod worker;

pub use breaker::{BreakerOptions, CircuitBreaker, CircuitState};
pub use controller::{ControllerHandle, ControllerOptions, OfflineController, OfflineState};
pub use listeners::{ListenerRegistry, Subscription};
pub use probe::{ConnectivityMonitor, ConnectivityState, LivenessProbe, NetworkProbe};
pub use retry::{RetryCondition, RetryHook, RetryOptions, with_retry};
pub use transport::{HttpTransport, Request, Response, Transport, TransportConfig};
pub use worker::{DrainReport, RequestOutcome, SyncEvent, SyncWorker, WorkerOptions};
