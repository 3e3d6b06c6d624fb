use std::sync::Arc;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::clock::SharedClock;
use crate::config::{CommanderConfig, SessionConfig};
use crate::orchestrator::Commander;
use crate::registry::InstanceRegistry;
use crate::session::SessionDirectory;
use crate::store::Stores;

#[derive(Clone)]
pub struct AppState {
    commander: Arc<Commander>,
    sessions: Arc<SessionDirectory>,
    session_config: SessionConfig,
    shutdown_grace: Duration,
    token: Option<Arc<str>>,
    metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        config: &CommanderConfig,
        stores: Stores,
        clock: SharedClock,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let registry = InstanceRegistry::new(stores.instances, clock.clone(), config.registry);
        let commander = Commander::new(registry, stores.ledger, stores.queue, clock);
        Self {
            commander: Arc::new(commander),
            sessions: Arc::new(SessionDirectory::default()),
            session_config: config.session.clone(),
            shutdown_grace: config.shutdown_grace,
            token: config.token.as_deref().map(Arc::from),
            metrics,
        }
    }

    pub fn commander(&self) -> Arc<Commander> {
        Arc::clone(&self.commander)
    }

    pub fn sessions(&self) -> Arc<SessionDirectory> {
        Arc::clone(&self.sessions)
    }

    pub fn session_config(&self) -> SessionConfig {
        self.session_config.clone()
    }

    /// Upper bound on how long shutdown waits for open sessions to finish.
    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    /// `true` when no token is configured or `presented` matches it.
    pub fn authorized(&self, presented: Option<&str>) -> bool {
        match &self.token {
            None => true,
            Some(expected) => presented == Some(expected.as_ref()),
        }
    }

    pub fn render_metrics(&self) -> String {
        self.metrics
            .as_ref()
            .map(PrometheusHandle::render)
            .unwrap_or_default()
    }
}
