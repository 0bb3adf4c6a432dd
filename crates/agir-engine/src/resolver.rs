use std::sync::Arc;

use tracing::debug;

use agir_core::error::{AgirError, Result};
use agir_core::process::{Node, ProcessDefinition};
use agir_core::traits::{LlmProvider, Persistence, ProviderFactory};
use agir_core::types::User;

/// A provider bound to the model it serves. Never empty.
#[derive(Clone)]
pub struct ProviderHandle {
    pub model: String,
    pub provider: Arc<dyn LlmProvider>,
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("model", &self.model)
            .field("provider", &self.provider.name())
            .finish()
    }
}

/// Decides which model serves a node.
///
/// Learner nodes borrow a user's model; other nodes use their assignee's model
/// when one is configured and fall back to the role's model.
pub struct ProviderResolver {
    factory: Arc<dyn ProviderFactory>,
    users: Arc<dyn Persistence>,
}

impl ProviderResolver {
    pub fn new(factory: Arc<dyn ProviderFactory>, users: Arc<dyn Persistence>) -> Self {
        Self { factory, users }
    }

    pub async fn resolve(
        &self,
        process: &ProcessDefinition,
        node: &Node,
        learner: &User,
    ) -> Result<ProviderHandle> {
        let model = self.model_for(process, node, learner).await?;
        debug!(node = %node.name, role = %node.role_id, model = %model, "Resolved model");
        let provider = self
            .factory
            .provider_for(&model)
            .map_err(|e| AgirError::ProviderUnavailable {
                node: node.name.clone(),
                model: model.clone(),
                message: e.to_string(),
            })?;
        Ok(ProviderHandle { model, provider })
    }

    /// Model used on the learner's behalf outside of a specific node.
    pub async fn resolve_learner(&self, learner: &User) -> Result<Option<ProviderHandle>> {
        match self.learner_model(learner).await? {
            Some(model) => {
                let provider = self.factory.provider_for(&model)?;
                Ok(Some(ProviderHandle { model, provider }))
            }
            None => Ok(None),
        }
    }

    async fn model_for(
        &self,
        process: &ProcessDefinition,
        node: &Node,
        learner: &User,
    ) -> Result<String> {
        let unresolved = || AgirError::Configuration {
            node: node.name.clone(),
            role: node.role_id.clone(),
        };

        if node.is_learner() {
            let model = match &node.assigned_to {
                Some(username) => self.user_model(username).await?,
                None => self.learner_model(learner).await?,
            };
            return model.ok_or_else(unresolved);
        }

        if let Some(username) = &node.assigned_to {
            if let Some(model) = self.user_model(username).await? {
                return Ok(model);
            }
            debug!(node = %node.name, user = %username, "Assignee has no model, using role default");
        }

        process
            .role(&node.role_id)
            .and_then(|r| r.model.clone())
            .ok_or_else(unresolved)
    }

    async fn user_model(&self, username: &str) -> Result<Option<String>> {
        Ok(self
            .users
            .find_user(username)
            .await?
            .and_then(|u| u.configured_model().map(str::to_string)))
    }

    /// The run's learner if active with a model, else the first such user in the directory.
    async fn learner_model(&self, learner: &User) -> Result<Option<String>> {
        if learner.is_active {
            if let Some(model) = learner.configured_model() {
                return Ok(Some(model.to_string()));
            }
        }
        Ok(self
            .users
            .first_active_user_with_model()
            .await?
            .and_then(|u| u.configured_model().map(str::to_string)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agir_core::process::{Learner, Role};
    use agir_test_utils::{MockFactory, RecordingStore};

    fn process() -> ProcessDefinition {
        ProcessDefinition::builder("Clinic")
            .learner(Learner::new("alice"))
            .role(Role::new("doctor", "Doctor").with_model("doctor-model"))
            .role(Role::new("nurse", "Nurse"))
            .node(Node::new("intro", "Intro", "doctor"))
            .node(Node::new("second", "Second", "doctor").with_assigned_to("dr_house"))
            .node(Node::new("triage", "Triage", "nurse"))
            .node(Node::new("consult", "Consult", "learner"))
            .node(Node::new("peer", "Peer", "learner").with_assigned_to("bob"))
            .build()
            .unwrap()
    }

    async fn resolver_with(users: &[User]) -> (ProviderResolver, Arc<MockFactory>) {
        let store = Arc::new(RecordingStore::new());
        for u in users {
            store.upsert_user(u).await.unwrap();
        }
        let factory = Arc::new(MockFactory::new());
        (ProviderResolver::new(factory.clone(), store), factory)
    }

    #[tokio::test]
    async fn test_role_model() {
        let (resolver, factory) = resolver_with(&[]).await;
        let p = process();
        let learner = User::new("alice");
        let handle = resolver.resolve(&p, p.node("intro").unwrap(), &learner).await.unwrap();
        assert_eq!(handle.model, "doctor-model");
        assert_eq!(factory.requested(), vec!["doctor-model".to_string()]);
    }

    #[tokio::test]
    async fn test_assignment_overrides_role() {
        let (resolver, _) = resolver_with(&[User::new("dr_house").with_model("house-model")]).await;
        let p = process();
        let handle = resolver
            .resolve(&p, p.node("second").unwrap(), &User::new("alice"))
            .await
            .unwrap();
        assert_eq!(handle.model, "house-model");
    }

    #[tokio::test]
    async fn test_assignee_without_model_falls_back_to_role() {
        let (resolver, _) = resolver_with(&[User::new("dr_house")]).await;
        let p = process();
        let handle = resolver
            .resolve(&p, p.node("second").unwrap(), &User::new("alice"))
            .await
            .unwrap();
        assert_eq!(handle.model, "doctor-model");
    }

    #[tokio::test]
    async fn test_missing_role_model_is_configuration_error() {
        let (resolver, factory) = resolver_with(&[]).await;
        let p = process();
        let err = resolver
            .resolve(&p, p.node("triage").unwrap(), &User::new("alice"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AgirError::Configuration { ref node, ref role } if node == "Triage" && role == "nurse"
        ));
        assert!(factory.requested().is_empty());
    }

    #[tokio::test]
    async fn test_learner_node_uses_learner_model() {
        let (resolver, _) = resolver_with(&[User::new("carol").with_model("carol-model")]).await;
        let p = process();
        let learner = User::new("alice").with_model("modelA");
        let handle = resolver
            .resolve(&p, p.node("consult").unwrap(), &learner)
            .await
            .unwrap();
        assert_eq!(handle.model, "modelA");
    }

    #[tokio::test]
    async fn test_learner_node_falls_back_to_directory() {
        let (resolver, _) = resolver_with(&[
            User::new("zed").with_model("zed-model").inactive(),
            User::new("carol").with_model("carol-model"),
        ])
        .await;
        let p = process();
        let handle = resolver
            .resolve(&p, p.node("consult").unwrap(), &User::new("alice"))
            .await
            .unwrap();
        assert_eq!(handle.model, "carol-model");
    }

    #[tokio::test]
    async fn test_learner_node_without_any_model_fails() {
        let (resolver, _) = resolver_with(&[User::new("zed")]).await;
        let p = process();
        let err = resolver
            .resolve(&p, p.node("consult").unwrap(), &User::new("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgirError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_assigned_learner_node_uses_assignee_only() {
        let (resolver, _) = resolver_with(&[User::new("bob")]).await;
        let p = process();
        // The learner has a model, but the node is bound to bob who has none
        let learner = User::new("alice").with_model("modelA");
        let err = resolver
            .resolve(&p, p.node("peer").unwrap(), &learner)
            .await
            .unwrap_err();
        assert!(matches!(err, AgirError::Configuration { .. }));
    }

    struct RejectingFactory;

    impl ProviderFactory for RejectingFactory {
        fn provider_for(&self, model: &str) -> Result<Arc<dyn LlmProvider>> {
            Err(AgirError::UnsupportedProvider(format!(
                "cannot infer a provider for model '{}'",
                model
            )))
        }
    }

    #[tokio::test]
    async fn test_factory_failure_names_node() {
        let resolver =
            ProviderResolver::new(Arc::new(RejectingFactory), Arc::new(RecordingStore::new()));
        let p = process();
        let err = resolver
            .resolve(&p, p.node("intro").unwrap(), &User::new("alice"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), agir_core::error::ErrorKind::Configuration);
        assert!(matches!(
            err,
            AgirError::ProviderUnavailable { ref node, ref model, ref message }
                if node == "Intro" && model == "doctor-model" && message.contains("cannot infer")
        ));
    }
}
