// src/state.rs
// Composition root. Every service is constructed and wired explicitly here;
// there is no ambient global state.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::errors::AppError;
use crate::llm::cloud::CloudLlmClient;
use crate::llm::fallback::{BreakerSet, CircuitBreakerConfig};
use crate::llm::local::acquisition::{AcquisitionSettings, ModelAcquisition};
use crate::llm::local::client::LocalLlmClient;
use crate::llm::local::{DeviceProbe, DownloadState};
use crate::llm::registry::ModelRegistry;
use crate::models::chat::CoachPersona;
use crate::services::coaching::CoachingService;
use crate::services::usage_ledger::UsageLedger;
use crate::storage::{keys, KeyValueStore, PersistenceQueue};

/// Shared application state handed to the (excluded) UI layer.
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ModelRegistry>,
    pub breakers: Arc<BreakerSet>,
    pub acquisition: Arc<ModelAcquisition>,
    pub ledger: Arc<UsageLedger>,
    pub coaching: Arc<CoachingService>,
    pub store: Arc<dyn KeyValueStore>,
    queue: Arc<PersistenceQueue>,
    ready_listener: Mutex<Option<JoinHandle<()>>>,
}

impl AppState {
    /// Builds and wires the full AI core, then runs startup model detection.
    ///
    /// # Errors
    ///
    /// Fails only on construction problems (bad HTTP client config, unusable
    /// models directory) — never on quota or network state.
    pub async fn build(
        config: Config,
        store: Arc<dyn KeyValueStore>,
        probe: Arc<dyn DeviceProbe>,
    ) -> Result<Arc<Self>, AppError> {
        let config = Arc::new(config);
        let registry = Arc::new(ModelRegistry::from_config(&config));
        let breakers = Arc::new(BreakerSet::new(CircuitBreakerConfig::from_config(&config)));
        let queue = Arc::new(PersistenceQueue::new(store.clone()));

        let acquisition = Arc::new(ModelAcquisition::new(
            AcquisitionSettings::from_config(&config),
            probe,
        )?);

        let cloud_client = Arc::new(CloudLlmClient::from_config(&config)?);
        let local_client = Arc::new(LocalLlmClient::from_config(&config, acquisition.clone())?);

        let ledger = Arc::new(UsageLedger::new(
            config.clone(),
            registry.clone(),
            store.clone(),
            queue.clone(),
        ));

        let coaching = Arc::new(CoachingService::new(
            config.clone(),
            registry.clone(),
            breakers.clone(),
            ledger.clone(),
            cloud_client,
            local_client,
            acquisition.clone(),
            store.clone(),
            queue.clone(),
            CoachPersona::default(),
        ));

        // Mirror the active-model identifier once the model becomes ready.
        let ready_listener = {
            let mut rx = acquisition.subscribe();
            let queue = queue.clone();
            let model_id = config.local_model_id.clone();
            tokio::spawn(async move {
                while rx.changed().await.is_ok() {
                    if matches!(*rx.borrow(), DownloadState::Completed) {
                        queue.put(keys::active_model(), model_id.clone());
                        break;
                    }
                }
            })
        };

        let state = Arc::new(Self {
            config,
            registry,
            breakers,
            acquisition,
            ledger,
            coaching,
            store,
            queue,
            ready_listener: Mutex::new(Some(ready_listener)),
        });

        // Startup detection; a download may begin in the background.
        let startup_state = state.acquisition.ensure_model().await?;
        info!(?startup_state, "AI core initialized");

        Ok(state)
    }

    /// Stops background tasks and drains pending persistence writes.
    pub async fn shutdown(&self) {
        self.acquisition.shutdown().await;
        if let Some(listener) = self.ready_listener.lock().await.take() {
            listener.abort();
        }
        self.queue.shutdown().await;
    }
}
