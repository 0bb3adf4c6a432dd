//! Post-run reflection for processes that declare an `evolution` block.

use agir_core::error::Result;
use agir_core::process::{Evolution, ProcessDefinition};
use agir_core::traits::LlmProvider;
use agir_core::types::{ConversationEntry, GenerationRequest, InstanceId, User};

const DEFAULT_OBJECTIVE: &str = "Improve your skills and knowledge.";

/// Entries longer than this are cut in the reflection transcript.
const EXCERPT_CHARS: usize = 200;

/// Custom-field key under which a run's reflection is stored.
pub fn reflection_field(id: &InstanceId) -> String {
    format!("evolution_{}", id)
}

pub fn system_prompt(learner: &User, evolution: &Evolution) -> String {
    let method = if evolution.method.is_empty() {
        "default"
    } else {
        evolution.method.as_str()
    };
    format!(
        "You are an AI mentor helping {} evolve their skills using the {} method. \
         Generate a thoughtful reflection on their performance and learning.",
        learner.display_name(),
        method
    )
}

pub fn prompt(
    process: &ProcessDefinition,
    evolution: &Evolution,
    learner: &User,
    history: &[ConversationEntry],
) -> String {
    let objective = process
        .learner()
        .attribute("evolution_objective")
        .unwrap_or(DEFAULT_OBJECTIVE);

    let summary = history
        .iter()
        .map(|e| {
            let node = process
                .node(&e.node_id)
                .map(|n| n.name.as_str())
                .unwrap_or(e.node_id.as_str());
            format!("- In {}, {} said: {}", node, e.role_id, excerpt(&e.content))
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Process: {}\n\
         Evolution Method: {}\n\
         Evolution Description: {}\n\
         User: {}\n\
         Evolution Objective: {}\n\n\
         Process Summary:\n{}\n\n\
         Based on this experience, provide:\n\
         1. A reflection on what the user has learned\n\
         2. Key insights gained\n\
         3. Skills that were improved\n\
         4. Suggestions for further improvement\n",
        process.name(),
        evolution.method,
        evolution.description,
        learner.display_name(),
        objective,
        summary
    )
}

fn excerpt(content: &str) -> String {
    match content.char_indices().nth(EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}...", &content[..cut]),
        None => content.to_string(),
    }
}

/// Ask the learner's model to reflect on a completed run.
pub async fn generate(
    provider: &dyn LlmProvider,
    process: &ProcessDefinition,
    evolution: &Evolution,
    learner: &User,
    history: &[ConversationEntry],
    temperature: f32,
    max_tokens: u32,
) -> Result<String> {
    let request = GenerationRequest {
        prompt: prompt(process, evolution, learner, history),
        system_prompt: Some(system_prompt(learner, evolution)),
        temperature,
        max_tokens,
    };
    provider.generate(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use agir_core::process::{Learner, Node, Role};

    fn process() -> ProcessDefinition {
        ProcessDefinition::builder("Clinic")
            .learner(
                Learner::new("alice")
                    .with_attribute("evolution_objective", "Listen more".into()),
            )
            .role(Role::new("doctor", "Doctor"))
            .node(Node::new("intro", "Intro", "doctor"))
            .evolution(Evolution {
                method: "reflection".into(),
                description: "Look back on the visit".into(),
            })
            .build()
            .unwrap()
    }

    #[test]
    fn test_prompt_contents() {
        let p = process();
        let evolution = p.evolution().unwrap();
        let history = vec![ConversationEntry {
            node_id: "intro".into(),
            role_id: "doctor".into(),
            content: "x".repeat(300),
        }];
        let text = prompt(&p, evolution, &User::new("alice"), &history);
        assert!(text.contains("Evolution Method: reflection"));
        assert!(text.contains("Evolution Objective: Listen more"));
        assert!(text.contains(&format!("- In Intro, doctor said: {}...", "x".repeat(200))));
        assert!(!text.contains(&"x".repeat(201)));
    }

    #[test]
    fn test_system_prompt_and_field() {
        let p = process();
        let sys = system_prompt(&User::new("alice"), p.evolution().unwrap());
        assert!(sys.contains("helping alice"));
        assert!(sys.contains("reflection method"));
        assert_eq!(reflection_field(&InstanceId::from_str("abc")), "evolution_abc");
    }

    #[test]
    fn test_excerpt_respects_char_boundaries() {
        let text = "é".repeat(250);
        let cut = excerpt(&text);
        assert_eq!(cut.chars().count(), EXCERPT_CHARS + 3);
        assert_eq!(excerpt("short"), "short");
    }
}
