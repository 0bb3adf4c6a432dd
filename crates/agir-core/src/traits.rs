use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::{AgirError, Result};
use crate::process::{Node, ProcessDefinition, Role};
use crate::types::*;

/// Text generation against one LLM backend.
pub trait LlmProvider: Send + Sync + 'static {
    /// Provider name (e.g., "openai", "ollama").
    fn name(&self) -> &str;

    /// Generate a completion for the request and return its full text.
    fn generate(&self, request: GenerationRequest) -> BoxFuture<'_, Result<String>>;

    /// Generate a completion constrained to `schema` and parse it as JSON.
    fn generate_json(
        &self,
        request: GenerationRequest,
        schema: serde_json::Value,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let mut request = request;
            request.prompt = format!(
                "{}\n\nRespond only with a JSON value matching this schema:\n{}",
                request.prompt,
                serde_json::to_string_pretty(&schema)?
            );
            let text = self.generate(request).await?;
            extract_json(&text)
        })
    }
}

/// Builds (or reuses) the provider that serves a model identifier.
pub trait ProviderFactory: Send + Sync + 'static {
    fn provider_for(&self, model: &str) -> Result<Arc<dyn LlmProvider>>;
}

/// Parse a JSON value from model output, tolerating a surrounding code fence.
pub fn extract_json(text: &str) -> Result<serde_json::Value> {
    let trimmed = text.trim();
    let body = match trimmed.find("```") {
        Some(start) => {
            let after = &trimmed[start + 3..];
            let after = after.strip_prefix("json").unwrap_or(after);
            match after.find("```") {
                Some(end) => &after[..end],
                None => after,
            }
        }
        None => trimmed,
    };
    serde_json::from_str(body.trim())
        .map_err(|e| AgirError::LlmParse(format!("invalid JSON in response: {}", e)))
}

/// User directory plus instance and step records.
pub trait Persistence: Send + Sync + 'static {
    /// Insert or update a user keyed by username.
    fn upsert_user(&self, user: &User) -> BoxFuture<'_, Result<()>>;

    fn find_user(&self, username: &str) -> BoxFuture<'_, Result<Option<User>>>;

    /// First active user with a non-empty model, in insertion order.
    fn first_active_user_with_model(&self) -> BoxFuture<'_, Result<Option<User>>>;

    /// Create an instance in RUNNING status.
    fn create_instance(
        &self,
        process: &ProcessDefinition,
        learner: &str,
    ) -> BoxFuture<'_, Result<InstanceId>>;

    /// Persist the instance's roles in one batch.
    fn materialize_roles(&self, id: &InstanceId, roles: &[Role]) -> BoxFuture<'_, Result<()>>;

    /// Persist the instance's nodes in one batch.
    fn materialize_nodes(&self, id: &InstanceId, nodes: &[Node]) -> BoxFuture<'_, Result<()>>;

    /// Record one executed node.
    fn record_step(
        &self,
        id: &InstanceId,
        step_index: usize,
        entry: &ConversationEntry,
    ) -> BoxFuture<'_, Result<()>>;

    /// Move a RUNNING instance to a terminal status.
    fn finalize_instance(&self, id: &InstanceId, status: RunStatus) -> BoxFuture<'_, Result<()>>;

    fn load_instance(&self, id: &InstanceId) -> BoxFuture<'_, Result<Option<InstanceRecord>>>;

    /// Steps of an instance in execution order.
    fn load_steps(&self, id: &InstanceId) -> BoxFuture<'_, Result<Vec<StepRecord>>>;

    /// Store a free-form field on a user (e.g. a reflection).
    fn save_custom_field(
        &self,
        username: &str,
        key: &str,
        value: &str,
    ) -> BoxFuture<'_, Result<()>>;
}

/// Everything a learner responder needs to answer one node.
pub struct LearnerTurn<'a> {
    pub process: &'a ProcessDefinition,
    pub node: &'a Node,
    pub learner: &'a User,
    pub provider: Arc<dyn LlmProvider>,
    pub context: &'a PromptContext,
    pub params: GenerationParams,
}

/// Produces the learner's response at learner-owned nodes.
pub trait LearnerResponder: Send + Sync + 'static {
    fn respond<'a>(&'a self, turn: LearnerTurn<'a>) -> BoxFuture<'a, Result<String>>;
}
