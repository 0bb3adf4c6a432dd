use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use agir_core::config::EngineConfig;
use agir_core::error::{AgirError, Result};
use agir_core::event::EventBus;
use agir_core::process::{Learner, Node, ProcessDefinition};
use agir_core::traits::{LearnerResponder, Persistence, ProviderFactory};
use agir_core::types::{
    ConversationEntry, InstanceId, RunEvent, RunStatus, User,
};

use crate::context::ContextBuilder;
use crate::executor::NodeExecutor;
use crate::reflection;
use crate::resolver::ProviderResolver;
use crate::router::TransitionRouter;

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub instance_id: InstanceId,
    pub status: RunStatus,
    /// One entry per visited node, in visitation order.
    pub history: Vec<ConversationEntry>,
    /// Learner reflection, when the process declares `evolution` and it succeeded.
    pub reflection: Option<String>,
    pub elapsed_ms: u64,
}

/// Walks a process from its first node until no successor remains.
///
/// Every run persists exactly one instance and finalizes it exactly once.
pub struct EvolutionEngine {
    store: Arc<dyn Persistence>,
    resolver: ProviderResolver,
    executor: NodeExecutor,
    config: EngineConfig,
    event_bus: Arc<EventBus>,
}

impl EvolutionEngine {
    pub fn new(
        store: Arc<dyn Persistence>,
        factory: Arc<dyn ProviderFactory>,
        learner: Arc<dyn LearnerResponder>,
    ) -> Self {
        let config = EngineConfig::default();
        Self {
            resolver: ProviderResolver::new(factory, store.clone()),
            executor: NodeExecutor::new(learner).with_params(config.generation_params()),
            store,
            config,
            event_bus: Arc::new(EventBus::default()),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.executor = self.executor.with_params(config.generation_params());
        self.config = config;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = bus;
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub async fn run(&self, process: &ProcessDefinition) -> Result<RunResult> {
        let start = Instant::now();
        info!(process = %process.name(), nodes = process.nodes().len(), "Starting process");

        let learner = self.ensure_learner(process.learner()).await?;
        let instance_id = self.store.create_instance(process, &learner.username).await?;
        self.event_bus.publish(RunEvent::RunStarted {
            instance_id: instance_id.clone(),
            process: process.name().to_string(),
        });

        let history = match self.traverse(process, &instance_id, &learner).await {
            Ok(history) => history,
            Err(e) => {
                error!(instance = %instance_id, error = %e, "Process failed");
                if let Err(fe) = self
                    .store
                    .finalize_instance(&instance_id, RunStatus::Failed)
                    .await
                {
                    error!(instance = %instance_id, error = %fe, "Failed to mark instance as failed");
                }
                self.event_bus.publish(RunEvent::RunFailed {
                    instance_id: instance_id.clone(),
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        self.store
            .finalize_instance(&instance_id, RunStatus::Completed)
            .await?;
        self.event_bus.publish(RunEvent::RunCompleted {
            instance_id: instance_id.clone(),
            steps: history.len(),
        });
        info!(instance = %instance_id, steps = history.len(), "Process completed");

        let reflection = self.reflect(process, &instance_id, &learner, &history).await;

        Ok(RunResult {
            instance_id,
            status: RunStatus::Completed,
            history,
            reflection,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Register the learner in the directory and read back the merged record.
    async fn ensure_learner(&self, learner: &Learner) -> Result<User> {
        let mut user = User::new(&learner.username);
        user.llm_model = learner.model.clone();
        for (key, value) in &learner.attributes {
            match (key.as_str(), value.as_str()) {
                ("first_name", Some(v)) => user.first_name = Some(v.to_string()),
                ("last_name", Some(v)) => user.last_name = Some(v.to_string()),
                ("email", Some(v)) => user.email = Some(v.to_string()),
                _ => {
                    user.profile.insert(key.clone(), value.clone());
                }
            }
        }

        self.store.upsert_user(&user).await?;
        Ok(self
            .store
            .find_user(&user.username)
            .await?
            .unwrap_or(user))
    }

    async fn traverse(
        &self,
        process: &ProcessDefinition,
        instance_id: &InstanceId,
        learner: &User,
    ) -> Result<Vec<ConversationEntry>> {
        self.store.materialize_roles(instance_id, process.roles()).await?;
        self.store.materialize_nodes(instance_id, process.nodes()).await?;

        let mut history: Vec<ConversationEntry> = Vec::new();
        let mut current: Option<&Node> = Some(process.start_node());

        while let Some(node) = current {
            if self.config.max_steps > 0 && history.len() >= self.config.max_steps {
                return Err(AgirError::LoopDetected {
                    node: node.name.clone(),
                    limit: self.config.max_steps,
                });
            }

            let handle = self.resolver.resolve(process, node, learner).await?;
            info!(
                node = %node.name,
                role = %node.role_id,
                model = %handle.model,
                step = history.len() + 1,
                "Processing node"
            );
            self.event_bus.publish(RunEvent::NodeStarted {
                node: node.name.clone(),
                role: node.role_id.clone(),
                model: handle.model.clone(),
            });

            let context = ContextBuilder::build(process, node, &history);
            let result = self
                .executor
                .execute(process, node, &handle, &context, learner)
                .await?;

            self.event_bus.publish(RunEvent::NodeCompleted {
                node: node.name.clone(),
                role: node.role_id.clone(),
                text: result.text.clone(),
            });

            let entry = result.into_entry();
            if let Err(e) = self
                .store
                .record_step(instance_id, history.len(), &entry)
                .await
            {
                warn!(node = %node.name, error = %e, "Failed to persist step, continuing");
                self.event_bus.publish(RunEvent::StepPersistFailed {
                    node: node.name.clone(),
                    error: e.to_string(),
                });
            }
            history.push(entry);

            current = TransitionRouter::next_node(process, node);
        }

        Ok(history)
    }

    /// Best effort: failures are logged and never change the run's status.
    async fn reflect(
        &self,
        process: &ProcessDefinition,
        instance_id: &InstanceId,
        learner: &User,
        history: &[ConversationEntry],
    ) -> Option<String> {
        let evolution = process.evolution()?;
        if !self.config.reflect {
            return None;
        }

        let handle = match self.resolver.resolve_learner(learner).await {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                warn!(learner = %learner.username, "No model available for reflection, skipping");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Could not resolve reflection model");
                return None;
            }
        };

        let text = match reflection::generate(
            handle.provider.as_ref(),
            process,
            evolution,
            learner,
            history,
            self.config.temperature,
            self.config.reflection_max_tokens,
        )
        .await
        {
            Ok(text) => text,
            Err(e) => {
                warn!(model = %handle.model, error = %e, "Reflection generation failed");
                return None;
            }
        };

        let field = reflection::reflection_field(instance_id);
        if let Err(e) = self
            .store
            .save_custom_field(&learner.username, &field, &text)
            .await
        {
            warn!(field = %field, error = %e, "Failed to store reflection");
            return Some(text);
        }

        info!(learner = %learner.username, field = %field, "Reflection saved");
        self.event_bus.publish(RunEvent::ReflectionSaved {
            instance_id: instance_id.clone(),
            field,
        });
        Some(text)
    }
}
