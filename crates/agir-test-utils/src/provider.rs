use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;

use agir_core::error::{AgirError, Result};
use agir_core::traits::{LlmProvider, ProviderFactory};
use agir_core::types::GenerationRequest;

/// Provider that replays scripted responses and records every request.
///
/// Once the script runs out it answers `"[<name>] response <n>"`.
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<String>>,
    failure: Option<String>,
    calls: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedProvider {
    pub fn new<S: Into<String>>(responses: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: "scripted".to_string(),
            script: Mutex::new(responses.into_iter().map(Into::into).collect()),
            failure: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Provider whose every call fails with `LlmRequest(message)`.
    pub fn failing(message: impl Into<String>) -> Self {
        let mut provider = Self::new(Vec::<String>::new());
        provider.failure = Some(message.into());
        provider
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.calls.lock().unwrap().clone()
    }
}

impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn generate(&self, request: GenerationRequest) -> BoxFuture<'_, Result<String>> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(request);
            calls.len()
        };
        let result = match &self.failure {
            Some(message) => Err(AgirError::LlmRequest(message.clone())),
            None => Ok(self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| format!("[{}] response {}", self.name, n))),
        };
        Box::pin(async move { result })
    }
}

/// Factory handing out one `ScriptedProvider` per model and logging each request.
#[derive(Default)]
pub struct MockFactory {
    providers: Mutex<HashMap<String, Arc<ScriptedProvider>>>,
    requested: Mutex<Vec<String>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-register the provider served for `model`.
    pub fn with_provider(self, model: &str, provider: ScriptedProvider) -> Self {
        self.providers
            .lock()
            .unwrap()
            .insert(model.to_string(), Arc::new(provider));
        self
    }

    /// Models requested so far, in order.
    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }

    pub fn provider(&self, model: &str) -> Option<Arc<ScriptedProvider>> {
        self.providers.lock().unwrap().get(model).cloned()
    }

    /// Total generate calls across every model.
    pub fn total_calls(&self) -> usize {
        self.providers
            .lock()
            .unwrap()
            .values()
            .map(|p| p.calls().len())
            .sum()
    }
}

impl ProviderFactory for MockFactory {
    fn provider_for(&self, model: &str) -> Result<Arc<dyn LlmProvider>> {
        self.requested.lock().unwrap().push(model.to_string());
        let provider = self
            .providers
            .lock()
            .unwrap()
            .entry(model.to_string())
            .or_insert_with(|| {
                Arc::new(ScriptedProvider::new(Vec::<String>::new()).with_name(model))
            })
            .clone();
        Ok(provider as Arc<dyn LlmProvider>)
    }
}
