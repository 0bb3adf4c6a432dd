use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use futures::future::BoxFuture;

use agir_core::error::{AgirError, Result};
use agir_core::process::{Node, ProcessDefinition, Role};
use agir_core::traits::Persistence;
use agir_core::types::{
    ConversationEntry, InstanceId, InstanceRecord, RunStatus, StepRecord, User,
};

#[derive(Default)]
struct State {
    users: Vec<User>,
    instances: HashMap<String, InstanceRecord>,
    roles: HashMap<String, Vec<Role>>,
    nodes: HashMap<String, Vec<Node>>,
    steps: HashMap<String, Vec<StepRecord>>,
    finalizations: Vec<(InstanceId, RunStatus)>,
    custom_fields: HashMap<(String, String), String>,
}

/// In-memory `Persistence` that records every write and can be told to fail.
#[derive(Default)]
pub struct RecordingStore {
    state: Mutex<State>,
    fail_steps: AtomicBool,
    fail_materialize: AtomicBool,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `record_step` call fail.
    pub fn fail_step_writes(&self) {
        self.fail_steps.store(true, Ordering::SeqCst);
    }

    /// Make node/role materialization fail.
    pub fn fail_materialization(&self) {
        self.fail_materialize.store(true, Ordering::SeqCst);
    }

    pub fn instance(&self, id: &InstanceId) -> Option<InstanceRecord> {
        self.state.lock().unwrap().instances.get(&id.0).cloned()
    }

    pub fn instances(&self) -> Vec<InstanceRecord> {
        self.state.lock().unwrap().instances.values().cloned().collect()
    }

    pub fn steps(&self, id: &InstanceId) -> Vec<StepRecord> {
        self.state
            .lock()
            .unwrap()
            .steps
            .get(&id.0)
            .cloned()
            .unwrap_or_default()
    }

    /// Every finalize call in order, including rejected ones.
    pub fn finalizations(&self) -> Vec<(InstanceId, RunStatus)> {
        self.state.lock().unwrap().finalizations.clone()
    }

    pub fn materialized_nodes(&self, id: &InstanceId) -> usize {
        self.state
            .lock()
            .unwrap()
            .nodes
            .get(&id.0)
            .map_or(0, Vec::len)
    }

    pub fn custom_field(&self, username: &str, key: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .custom_fields
            .get(&(username.to_string(), key.to_string()))
            .cloned()
    }

    pub fn user(&self, username: &str) -> Option<User> {
        self.state
            .lock()
            .unwrap()
            .users
            .iter()
            .find(|u| u.username == username)
            .cloned()
    }
}

impl Persistence for RecordingStore {
    fn upsert_user(&self, user: &User) -> BoxFuture<'_, Result<()>> {
        let user = user.clone();
        let mut state = self.state.lock().unwrap();
        match state.users.iter_mut().find(|u| u.username == user.username) {
            Some(existing) => {
                if user.llm_model.is_some() {
                    existing.llm_model = user.llm_model;
                }
                if user.first_name.is_some() {
                    existing.first_name = user.first_name;
                }
                if user.last_name.is_some() {
                    existing.last_name = user.last_name;
                }
                if user.email.is_some() {
                    existing.email = user.email;
                }
                if !user.profile.is_empty() {
                    existing.profile = user.profile;
                }
                existing.is_active = user.is_active;
            }
            None => state.users.push(user),
        }
        Box::pin(async { Ok(()) })
    }

    fn find_user(&self, username: &str) -> BoxFuture<'_, Result<Option<User>>> {
        let found = self.user(username);
        Box::pin(async move { Ok(found) })
    }

    fn first_active_user_with_model(&self) -> BoxFuture<'_, Result<Option<User>>> {
        let found = self
            .state
            .lock()
            .unwrap()
            .users
            .iter()
            .find(|u| u.is_active && u.configured_model().is_some())
            .cloned();
        Box::pin(async move { Ok(found) })
    }

    fn create_instance(
        &self,
        process: &ProcessDefinition,
        learner: &str,
    ) -> BoxFuture<'_, Result<InstanceId>> {
        let id = InstanceId::new();
        let record = InstanceRecord {
            id: id.clone(),
            process_name: process.name().to_string(),
            learner: learner.to_string(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
        };
        self.state
            .lock()
            .unwrap()
            .instances
            .insert(id.0.clone(), record);
        Box::pin(async move { Ok(id) })
    }

    fn materialize_roles(&self, id: &InstanceId, roles: &[Role]) -> BoxFuture<'_, Result<()>> {
        let result = if self.fail_materialize.load(Ordering::SeqCst) {
            Err(AgirError::Database("materialization refused".into()))
        } else {
            self.state
                .lock()
                .unwrap()
                .roles
                .insert(id.0.clone(), roles.to_vec());
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn materialize_nodes(&self, id: &InstanceId, nodes: &[Node]) -> BoxFuture<'_, Result<()>> {
        let result = if self.fail_materialize.load(Ordering::SeqCst) {
            Err(AgirError::Database("materialization refused".into()))
        } else {
            self.state
                .lock()
                .unwrap()
                .nodes
                .insert(id.0.clone(), nodes.to_vec());
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn record_step(
        &self,
        id: &InstanceId,
        step_index: usize,
        entry: &ConversationEntry,
    ) -> BoxFuture<'_, Result<()>> {
        let result = if self.fail_steps.load(Ordering::SeqCst) {
            Err(AgirError::Database("disk full".into()))
        } else {
            self.state
                .lock()
                .unwrap()
                .steps
                .entry(id.0.clone())
                .or_default()
                .push(StepRecord {
                    step_index,
                    node_id: entry.node_id.clone(),
                    role_id: entry.role_id.clone(),
                    content: entry.content.clone(),
                    created_at: Utc::now(),
                });
            Ok(())
        };
        Box::pin(async move { result })
    }

    fn finalize_instance(&self, id: &InstanceId, status: RunStatus) -> BoxFuture<'_, Result<()>> {
        let mut state = self.state.lock().unwrap();
        state.finalizations.push((id.clone(), status));
        let result = match state.instances.get_mut(&id.0) {
            Some(record) if record.status == RunStatus::Running && status.is_terminal() => {
                record.status = status;
                record.finished_at = Some(Utc::now());
                Ok(())
            }
            Some(record) => Err(AgirError::Database(format!(
                "instance {} already {}",
                id, record.status
            ))),
            None => Err(AgirError::Database(format!("unknown instance {}", id))),
        };
        Box::pin(async move { result })
    }

    fn load_instance(&self, id: &InstanceId) -> BoxFuture<'_, Result<Option<InstanceRecord>>> {
        let found = self.instance(id);
        Box::pin(async move { Ok(found) })
    }

    fn load_steps(&self, id: &InstanceId) -> BoxFuture<'_, Result<Vec<StepRecord>>> {
        let steps = self.steps(id);
        Box::pin(async move { Ok(steps) })
    }

    fn save_custom_field(
        &self,
        username: &str,
        key: &str,
        value: &str,
    ) -> BoxFuture<'_, Result<()>> {
        self.state
            .lock()
            .unwrap()
            .custom_fields
            .insert((username.to_string(), key.to_string()), value.to_string());
        Box::pin(async { Ok(()) })
    }
}
