//! Process definitions: roles, nodes and transitions, validated once at load time.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::error::{AgirError, Result};
use crate::types::normalize_model;

/// Role id that binds a node to the learner instead of a configured persona.
pub const LEARNER_ROLE: &str = "learner";

/// A named persona with an associated model.
#[derive(Debug, Clone, PartialEq)]
pub struct Role {
    pub id: String,
    pub name: String,
    pub description: String,
    /// `None` means "not configured"; blank identifiers are normalized away.
    pub model: Option<String>,
    pub system_prompt_template: Option<String>,
}

impl Role {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            model: None,
            system_prompt_template: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = normalize_model(Some(model.into()));
        self
    }

    pub fn with_system_prompt_template(mut self, template: impl Into<String>) -> Self {
        self.system_prompt_template = Some(template.into());
        self
    }
}

/// One phase of the process.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub description: String,
    pub role_id: String,
    /// Username whose configured model overrides the role default.
    pub assigned_to: Option<String>,
}

impl Node {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            role_id: role_id.into(),
            assigned_to: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_assigned_to(mut self, user: impl Into<String>) -> Self {
        self.assigned_to = Some(user.into()).filter(|u: &String| !u.trim().is_empty());
        self
    }

    pub fn is_learner(&self) -> bool {
        self.role_id == LEARNER_ROLE
    }
}

/// Directed edge between two nodes, by node name.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: String,
    pub to: String,
    /// Descriptive only. Never evaluated.
    pub condition: Option<String>,
}

impl Transition {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// The subject the simulation runs for.
#[derive(Debug, Clone, PartialEq)]
pub struct Learner {
    pub username: String,
    pub model: Option<String>,
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl Learner {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            model: None,
            attributes: serde_json::Map::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = normalize_model(Some(model.into()));
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// String-valued profile attribute.
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }
}

/// Optional post-run reflection descriptor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Evolution {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub description: String,
}

/// A validated, immutable process definition.
#[derive(Debug, Clone)]
pub struct ProcessDefinition {
    name: String,
    description: String,
    learner: Learner,
    roles: Vec<Role>,
    nodes: Vec<Node>,
    transitions: Vec<Transition>,
    evolution: Option<Evolution>,
}

impl ProcessDefinition {
    pub fn builder(name: impl Into<String>) -> ProcessBuilder {
        ProcessBuilder::new(name)
    }

    /// Load and validate a definition from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        debug!(path = %path.display(), "Loading process definition");
        Self::from_yaml(&content)
    }

    /// Parse a YAML document. Accepts both a bare layout and one wrapped in `process:`.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let doc: serde_yaml::Value = serde_yaml::from_str(content)?;
        let doc = match doc {
            serde_yaml::Value::Mapping(mut map) => {
                match map.remove(serde_yaml::Value::String("process".into())) {
                    Some(inner @ serde_yaml::Value::Mapping(_)) => inner,
                    Some(other) => {
                        map.insert(serde_yaml::Value::String("process".into()), other);
                        serde_yaml::Value::Mapping(map)
                    }
                    None => serde_yaml::Value::Mapping(map),
                }
            }
            serde_yaml::Value::Null => {
                return Err(AgirError::Validation("process definition is empty".into()))
            }
            _ => {
                return Err(AgirError::Validation(
                    "process definition must be a mapping".into(),
                ))
            }
        };
        let raw: RawProcess = serde_yaml::from_value(doc)?;
        raw.into_builder()?.build()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn learner(&self) -> &Learner {
        &self.learner
    }

    pub fn roles(&self) -> &[Role] {
        &self.roles
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn evolution(&self) -> Option<&Evolution> {
        self.evolution.as_ref()
    }

    pub fn role(&self, id: &str) -> Option<&Role> {
        self.roles.iter().find(|r| r.id == id)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Outgoing transitions of `node`, in declaration order.
    pub fn outgoing<'a>(&'a self, node: &'a Node) -> impl Iterator<Item = &'a Transition> + 'a {
        self.transitions.iter().filter(move |t| t.from == node.name)
    }

    /// The first declared node. Validation guarantees it exists.
    pub fn start_node(&self) -> &Node {
        &self.nodes[0]
    }

    /// Human-readable name of the role a node acts as.
    pub fn acting_as(&self, node: &Node) -> String {
        match self.role(&node.role_id) {
            Some(role) if !role.name.is_empty() => role.name.clone(),
            _ => node.role_id.clone(),
        }
    }
}

/// Collects the parts of a definition and validates them in `build`.
#[derive(Debug, Clone, Default)]
pub struct ProcessBuilder {
    name: String,
    description: String,
    learner: Option<Learner>,
    roles: Vec<Role>,
    nodes: Vec<Node>,
    transitions: Vec<Transition>,
    evolution: Option<Evolution>,
}

impl ProcessBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn learner(mut self, learner: Learner) -> Self {
        self.learner = Some(learner);
        self
    }

    pub fn role(mut self, role: Role) -> Self {
        self.roles.push(role);
        self
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn transition(mut self, transition: Transition) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn evolution(mut self, evolution: Evolution) -> Self {
        self.evolution = Some(evolution);
        self
    }

    pub fn build(self) -> Result<ProcessDefinition> {
        let learner = match self.learner {
            Some(l) if !l.username.trim().is_empty() => l,
            _ => return Err(invalid("learner descriptor is missing a username")),
        };

        if self.nodes.is_empty() {
            return Err(invalid("process has no nodes"));
        }

        let mut role_ids = HashSet::new();
        for role in &self.roles {
            if !role_ids.insert(role.id.as_str()) {
                return Err(invalid(format!("duplicate role id '{}'", role.id)));
            }
        }

        let mut node_ids = HashSet::new();
        let mut node_names = HashSet::new();
        for node in &self.nodes {
            if !node_ids.insert(node.id.as_str()) {
                return Err(invalid(format!("duplicate node id '{}'", node.id)));
            }
            if !node_names.insert(node.name.as_str()) {
                return Err(invalid(format!("duplicate node name '{}'", node.name)));
            }
            if node.role_id != LEARNER_ROLE && !role_ids.contains(node.role_id.as_str()) {
                return Err(invalid(format!(
                    "node '{}' references undeclared role '{}'",
                    node.name, node.role_id
                )));
            }
        }

        for t in &self.transitions {
            for endpoint in [&t.from, &t.to] {
                if !node_names.contains(endpoint.as_str()) {
                    return Err(invalid(format!(
                        "transition {} -> {} references undeclared node '{}'",
                        t.from, t.to, endpoint
                    )));
                }
            }
        }

        let name = if self.name.trim().is_empty() {
            "Unnamed Process".to_string()
        } else {
            self.name
        };

        Ok(ProcessDefinition {
            name,
            description: self.description,
            learner,
            roles: self.roles,
            nodes: self.nodes,
            transitions: self.transitions,
            evolution: self.evolution,
        })
    }
}

fn invalid(msg: impl Into<String>) -> AgirError {
    AgirError::Validation(msg.into())
}

// -- YAML document shape --

#[derive(Debug, Deserialize)]
struct RawProcess {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default, alias = "target_user")]
    learner: Option<RawLearner>,
    #[serde(default)]
    roles: Vec<RawRole>,
    #[serde(default)]
    nodes: Vec<RawNode>,
    #[serde(default)]
    transitions: Vec<RawTransition>,
    #[serde(default)]
    evolution: Option<Evolution>,
}

#[derive(Debug, Deserialize)]
struct RawLearner {
    #[serde(default)]
    username: Option<String>,
    #[serde(default, alias = "llm_model")]
    model: Option<String>,
    #[serde(flatten)]
    attributes: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawRole {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default, alias = "llm_model")]
    model: Option<String>,
    #[serde(default)]
    system_prompt_template: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawNode {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    description: String,
    role: String,
    #[serde(default)]
    assigned_to: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTransition {
    from: String,
    to: String,
    #[serde(default)]
    condition: Option<String>,
}

impl RawProcess {
    fn into_builder(self) -> Result<ProcessBuilder> {
        let raw_learner = self
            .learner
            .ok_or_else(|| invalid("learner descriptor is missing"))?;
        let mut learner = Learner::new(raw_learner.username.unwrap_or_default());
        learner.model = normalize_model(raw_learner.model);
        learner.attributes = raw_learner.attributes.into_iter().collect();

        let mut builder = ProcessBuilder::new(self.name)
            .description(self.description)
            .learner(learner);

        for r in self.roles {
            let name = r.name.unwrap_or_else(|| r.id.clone());
            let mut role = Role::new(r.id, name).with_description(r.description);
            role.model = normalize_model(r.model);
            role.system_prompt_template = r.system_prompt_template;
            builder = builder.role(role);
        }

        for n in self.nodes {
            let id = n.id.unwrap_or_else(|| n.name.clone());
            let mut node = Node::new(id, n.name, n.role).with_description(n.description);
            if let Some(user) = n.assigned_to {
                node = node.with_assigned_to(user);
            }
            builder = builder.node(node);
        }

        for t in self.transitions {
            let mut transition = Transition::new(t.from, t.to);
            transition.condition = t.condition;
            builder = builder.transition(transition);
        }

        if let Some(evolution) = self.evolution {
            builder = builder.evolution(evolution);
        }

        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLINIC: &str = r#"
name: Clinic Visit
description: A short consultation
learner:
  username: alice
  model: modelA
  first_name: Alice
  evolution_objective: Improve bedside manner
roles:
  - id: doctor
    name: Doctor
    description: A general practitioner
    model: gpt-4o
  - id: nurse
    name: Nurse
    model: ""
nodes:
  - id: intro
    name: Intro
    description: Greet the patient
    role: doctor
  - id: consult
    name: Consult
    description: Answer the doctor
    role: learner
transitions:
  - from: Intro
    to: Consult
    condition: patient arrived
evolution:
  method: reflection
  description: Reflect on the visit
"#;

    fn minimal() -> ProcessBuilder {
        ProcessDefinition::builder("p")
            .learner(Learner::new("alice"))
            .role(Role::new("doctor", "Doctor"))
    }

    #[test]
    fn test_parse_bare_layout() {
        let p = ProcessDefinition::from_yaml(CLINIC).unwrap();
        assert_eq!(p.name(), "Clinic Visit");
        assert_eq!(p.learner().username, "alice");
        assert_eq!(p.learner().model.as_deref(), Some("modelA"));
        assert_eq!(p.learner().attribute("first_name"), Some("Alice"));
        assert_eq!(p.roles().len(), 2);
        assert_eq!(p.role("doctor").unwrap().model.as_deref(), Some("gpt-4o"));
        assert!(p.role("nurse").unwrap().model.is_none());
        assert_eq!(p.start_node().name, "Intro");
        assert!(p.node_by_name("Consult").unwrap().is_learner());
        assert_eq!(
            p.transitions()[0].condition.as_deref(),
            Some("patient arrived")
        );
        assert_eq!(p.evolution().unwrap().method, "reflection");
    }

    #[test]
    fn test_parse_wrapped_layout_and_aliases() {
        let yaml = r#"
process:
  name: Wrapped
  target_user:
    username: bob
    llm_model: llama3
  roles:
    - id: coach
      llm_model: claude-3-haiku
  nodes:
    - name: Warmup
      role: coach
"#;
        let p = ProcessDefinition::from_yaml(yaml).unwrap();
        assert_eq!(p.name(), "Wrapped");
        assert_eq!(p.learner().model.as_deref(), Some("llama3"));
        let role = p.role("coach").unwrap();
        assert_eq!(role.name, "coach");
        assert_eq!(role.model.as_deref(), Some("claude-3-haiku"));
        // Node id defaults to its name
        assert_eq!(p.start_node().id, "Warmup");
    }

    #[test]
    fn test_rejects_empty_nodes() {
        let err = minimal().build().unwrap_err();
        assert!(matches!(err, AgirError::Validation(_)));
    }

    #[test]
    fn test_rejects_undeclared_role() {
        let err = minimal()
            .node(Node::new("a", "A", "surgeon"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("surgeon"));
    }

    #[test]
    fn test_learner_role_is_implicit() {
        let p = minimal().node(Node::new("a", "A", LEARNER_ROLE)).build().unwrap();
        assert!(p.role(LEARNER_ROLE).is_none());
        assert_eq!(p.acting_as(p.start_node()), LEARNER_ROLE);
    }

    #[test]
    fn test_rejects_dangling_transition() {
        let err = minimal()
            .node(Node::new("a", "A", "doctor"))
            .transition(Transition::new("A", "Nowhere"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("Nowhere"));
    }

    #[test]
    fn test_rejects_missing_learner_username() {
        let err = ProcessDefinition::builder("p")
            .learner(Learner::new("  "))
            .role(Role::new("doctor", "Doctor"))
            .node(Node::new("a", "A", "doctor"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("username"));

        let yaml = "name: x\nnodes:\n  - name: A\n    role: learner\n";
        assert!(matches!(
            ProcessDefinition::from_yaml(yaml),
            Err(AgirError::Validation(_))
        ));
    }

    #[test]
    fn test_rejects_duplicates() {
        let err = minimal()
            .node(Node::new("a", "A", "doctor"))
            .node(Node::new("a", "B", "doctor"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate node id"));

        let err = minimal()
            .node(Node::new("a", "A", "doctor"))
            .node(Node::new("b", "A", "doctor"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate node name"));
    }

    #[test]
    fn test_outgoing_preserves_declaration_order() {
        let p = minimal()
            .node(Node::new("a", "A", "doctor"))
            .node(Node::new("b", "B", "doctor"))
            .node(Node::new("c", "C", "doctor"))
            .transition(Transition::new("A", "C"))
            .transition(Transition::new("B", "A"))
            .transition(Transition::new("A", "B"))
            .build()
            .unwrap();
        let a = p.node("a").unwrap();
        let targets: Vec<&str> = p.outgoing(a).map(|t| t.to.as_str()).collect();
        assert_eq!(targets, vec!["C", "B"]);
    }

    #[test]
    fn test_non_mapping_document_rejected() {
        assert!(ProcessDefinition::from_yaml("").is_err());
        assert!(ProcessDefinition::from_yaml("- a\n- b\n").is_err());
    }
}
