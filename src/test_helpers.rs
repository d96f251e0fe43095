// src/test_helpers.rs
// Mocks and builders shared by unit tests and the integration suite.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use async_trait::async_trait;

use crate::config::Config;
use crate::errors::AppError;
use crate::llm::fallback::{BreakerSet, CircuitBreakerConfig};
use crate::llm::local::acquisition::{AcquisitionSettings, ModelAcquisition};
use crate::llm::local::DeviceProbe;
use crate::llm::registry::ModelRegistry;
use crate::llm::{AiClient, CompletionRequest, CompletionResponse};
use crate::models::chat::CoachPersona;
use crate::services::coaching::CoachingService;
use crate::services::usage_ledger::UsageLedger;
use crate::storage::{KeyValueStore, MemoryStore, PersistenceQueue};

/// Device probe returning fixed answers.
pub struct FixedProbe {
    free_bytes: u64,
    unmetered: bool,
}

impl FixedProbe {
    pub fn new(free_bytes: u64, unmetered: bool) -> Self {
        Self {
            free_bytes,
            unmetered,
        }
    }

    /// Unlimited storage on an unmetered network.
    pub fn plenty() -> Self {
        Self::new(u64::MAX, true)
    }
}

impl DeviceProbe for FixedProbe {
    fn free_storage_bytes(&self, _path: &Path) -> u64 {
        self.free_bytes
    }

    fn is_unmetered_network(&self) -> bool {
        self.unmetered
    }
}

/// Scriptable [`AiClient`] that records the model ids it was called with.
pub struct MockAiClient {
    script: Mutex<VecDeque<Result<CompletionResponse, AppError>>>,
    fallthrough: Option<CompletionResponse>,
    calls: Mutex<Vec<String>>,
}

impl MockAiClient {
    /// Always succeeds with the given text.
    pub fn always(text: &str) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallthrough: Some(ok_response(text)),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Always fails.
    pub fn failing() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallthrough: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Plays back queued results first, then behaves like `always(text)`.
    pub fn scripted(results: Vec<Result<CompletionResponse, AppError>>, then: &str) -> Self {
        Self {
            script: Mutex::new(results.into()),
            fallthrough: Some(ok_response(then)),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    pub async fn models_called(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }
}

pub fn ok_response(text: &str) -> CompletionResponse {
    CompletionResponse {
        text: text.to_string(),
        prompt_tokens: 120,
        completion_tokens: 80,
    }
}

#[async_trait]
impl AiClient for MockAiClient {
    async fn complete(
        &self,
        model_id: &str,
        _request: CompletionRequest,
    ) -> Result<CompletionResponse, AppError> {
        self.calls.lock().await.push(model_id.to_string());
        if let Some(result) = self.script.lock().await.pop_front() {
            return result;
        }
        match &self.fallthrough {
            Some(response) => Ok(response.clone()),
            None => Err(AppError::CloudApi("mock backend down".to_string())),
        }
    }
}

/// Config pointing all filesystem paths into a temp dir, with downloads
/// disabled so nothing touches the network.
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.models_dir = dir.join("models").to_string_lossy().to_string();
    config.auto_start_download = false;
    config
}

/// Fully wired coaching stack over mock backends and an in-memory store.
pub struct TestHarness {
    pub config: Arc<Config>,
    pub coaching: Arc<CoachingService>,
    pub ledger: Arc<UsageLedger>,
    pub breakers: Arc<BreakerSet>,
    pub registry: Arc<ModelRegistry>,
    pub acquisition: Arc<ModelAcquisition>,
    pub store: Arc<MemoryStore>,
    pub queue: Arc<PersistenceQueue>,
}

pub fn build_harness(
    dir: &Path,
    cloud_client: Arc<dyn AiClient>,
    local_client: Arc<dyn AiClient>,
) -> TestHarness {
    let config = Arc::new(test_config(dir));
    let registry = Arc::new(ModelRegistry::from_config(&config));
    let breakers = Arc::new(BreakerSet::new(CircuitBreakerConfig::from_config(&config)));
    let store = Arc::new(MemoryStore::new());
    let kv: Arc<dyn KeyValueStore> = store.clone();
    let queue = Arc::new(PersistenceQueue::new(kv.clone()));
    let acquisition = Arc::new(
        ModelAcquisition::new(
            AcquisitionSettings::from_config(&config),
            Arc::new(FixedProbe::plenty()),
        )
        .expect("acquisition builds"),
    );
    let ledger = Arc::new(UsageLedger::new(
        config.clone(),
        registry.clone(),
        kv.clone(),
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
        kv,
        queue.clone(),
        CoachPersona::default(),
    ));
    TestHarness {
        config,
        coaching,
        ledger,
        breakers,
        registry,
        acquisition,
        store,
        queue,
    }
}
