use futures::future::BoxFuture;
use tracing::debug;

use agir_core::error::Result;
use agir_core::traits::LlmProvider;
use agir_core::types::GenerationRequest;

pub const DUMMY_RESPONSE: &str = "This is a dummy response for debugging purposes.";

/// Offline provider for dry runs. Returns a fixed response without network access.
#[derive(Debug, Default, Clone)]
pub struct DummyProvider;

impl DummyProvider {
    pub fn new() -> Self {
        Self
    }
}

impl LlmProvider for DummyProvider {
    fn name(&self) -> &str {
        "dummy"
    }

    fn generate(&self, request: GenerationRequest) -> BoxFuture<'_, Result<String>> {
        debug!(prompt_len = request.prompt.len(), "Dummy provider called");
        Box::pin(async { Ok(DUMMY_RESPONSE.to_string()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agir_core::types::GenerationParams;

    #[tokio::test]
    async fn test_dummy_response() {
        let text = DummyProvider::new()
            .generate(GenerationRequest::new("anything", GenerationParams::default()))
            .await
            .unwrap();
        assert_eq!(text, DUMMY_RESPONSE);
    }
}
