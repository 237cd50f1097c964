//! Startup wiring: one store, one breaker, one controller per process.

use std::sync::Arc;
use std::time::Duration;

use harbor_client::{
    BreakerOptions, CircuitBreaker, ConnectivityMonitor, ControllerOptions, HttpTransport, LivenessProbe,
    OfflineController, SyncWorker, Transport, TransportConfig, WorkerOptions,
};
use harbor_core::{AppConfig, Error, Store};

/// Name of the breaker guarding the upstream API.
const UPSTREAM: &str = "upstream";

pub struct App {
    pub config: AppConfig,
    pub controller: Arc<OfflineController>,
    liveness: Option<LivenessProbe>,
}

impl App {
    /// Open the store and build the layer.
    ///
    /// `offline` forces the initial connectivity state; otherwise the process
    /// starts online and the liveness probe (if configured) corrects it.
    /// `debounce` overrides the configured probe debounce.
    pub async fn open(config: AppConfig, offline: bool, debounce: Duration) -> Result<Self, Error> {
        let store = Store::open(&config.db_path).await?;
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(TransportConfig::from(&config))?);
        let monitor = ConnectivityMonitor::new(!offline, debounce);
        let breaker = Arc::new(CircuitBreaker::new(UPSTREAM, BreakerOptions::from(&config.breaker)));

        let liveness = match (&config.probe.liveness_url, offline) {
            (Some(url), false) => {
                Some(LivenessProbe::new(Arc::clone(&transport), url.as_str(), config.probe.liveness_interval(), monitor.clone()))
            }
            _ => None,
        };

        let worker = SyncWorker::new(store, transport, Arc::new(monitor), breaker, WorkerOptions::from(&config));
        let controller = Arc::new(OfflineController::new(Arc::new(worker), ControllerOptions::from(&config)));

        tracing::debug!(db_path = %config.db_path.display(), offline, "opened harbor");
        Ok(Self { config, controller, liveness })
    }

    /// Ping the liveness endpoint once, if one is configured.
    pub async fn check_liveness(&self) {
        if let Some(probe) = &self.liveness {
            probe.check().await;
        }
    }

    /// Hand the liveness probe to a background task.
    pub fn spawn_liveness(&mut self) -> Option<tokio::task::JoinHandle<()>> {
        self.liveness.take().map(LivenessProbe::spawn)
    }
}
