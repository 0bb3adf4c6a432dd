use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error};

use agir_core::error::{AgirError, Result};
use agir_core::process::{Node, ProcessDefinition};
use agir_core::traits::{LearnerResponder, LearnerTurn};
use agir_core::types::{GenerationParams, GenerationRequest, GenerationResult, PromptContext, User};

use crate::resolver::ProviderHandle;

/// Produces one response for one node. No retries: any failure becomes an execution error.
pub struct NodeExecutor {
    learner: Arc<dyn LearnerResponder>,
    params: GenerationParams,
}

impl NodeExecutor {
    pub fn new(learner: Arc<dyn LearnerResponder>) -> Self {
        Self {
            learner,
            params: GenerationParams::default(),
        }
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn params(&self) -> GenerationParams {
        self.params
    }

    pub async fn execute(
        &self,
        process: &ProcessDefinition,
        node: &Node,
        handle: &ProviderHandle,
        context: &PromptContext,
        learner: &User,
    ) -> Result<GenerationResult> {
        let start = Instant::now();

        let outcome = if node.is_learner() {
            self.learner
                .respond(LearnerTurn {
                    process,
                    node,
                    learner,
                    provider: handle.provider.clone(),
                    context,
                    params: self.params,
                })
                .await
        } else {
            let request = GenerationRequest::new(context.user_prompt.clone(), self.params)
                .with_system(context.system_prompt.clone());
            handle.provider.generate(request).await
        };

        let text = outcome.map_err(|e| {
            error!(node = %node.name, model = %handle.model, error = %e, "Node execution failed");
            match e {
                already @ AgirError::Execution { .. } => already,
                other => AgirError::execution(&node.name, other),
            }
        })?;

        debug!(
            node = %node.name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            chars = text.len(),
            "Node produced response"
        );

        Ok(GenerationResult {
            text,
            node_id: node.id.clone(),
            role_id: node.role_id.clone(),
        })
    }
}
