use agir_core::process::{Node, ProcessDefinition};
use agir_core::types::{ConversationEntry, PromptContext};

/// Marker used in place of a transcript when nothing has been said yet.
pub const NO_HISTORY: &str = "No previous conversation.";

/// Turns a node plus the accumulated history into the prompts for its provider.
///
/// Pure: identical inputs always produce identical prompts.
pub struct ContextBuilder;

impl ContextBuilder {
    pub fn build(
        process: &ProcessDefinition,
        node: &Node,
        history: &[ConversationEntry],
    ) -> PromptContext {
        PromptContext {
            system_prompt: Self::system_prompt(process, node),
            user_prompt: Self::user_prompt(node, history),
        }
    }

    fn system_prompt(process: &ProcessDefinition, node: &Node) -> String {
        let acting_as = process.acting_as(node);
        let mut prompt = format!(
            "You are simulating a {} in a process called {}. {}",
            acting_as,
            process.name(),
            node.description
        );

        if let Some(template) = process
            .role(&node.role_id)
            .and_then(|r| r.system_prompt_template.as_deref())
        {
            let persona = template
                .replace("{role}", &acting_as)
                .replace("{process}", process.name())
                .replace("{phase}", &node.name);
            if !persona.trim().is_empty() {
                prompt.push_str("\n\n");
                prompt.push_str(persona.trim());
            }
        }

        prompt
    }

    fn user_prompt(node: &Node, history: &[ConversationEntry]) -> String {
        let mut lines = vec![
            format!("You are now in the '{}' phase.", node.name),
            node.description.clone(),
            "\nPrevious conversation:".to_string(),
        ];
        lines.extend(Self::transcript(history));
        lines.push("\nPlease respond based on your role and the current phase.".to_string());
        lines.join("\n")
    }

    /// One numbered line per entry, 1-indexed, or the no-history marker.
    pub fn transcript(history: &[ConversationEntry]) -> Vec<String> {
        if history.is_empty() {
            return vec![NO_HISTORY.to_string()];
        }
        history
            .iter()
            .enumerate()
            .map(|(i, e)| format!("{}. {}: {}", i + 1, e.role_id, e.content))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agir_core::process::{Learner, Role};

    fn process() -> ProcessDefinition {
        ProcessDefinition::builder("Clinic Visit")
            .learner(Learner::new("alice"))
            .role(Role::new("doctor", "Doctor").with_model("gpt-4o"))
            .role(
                Role::new("nurse", "Nurse")
                    .with_system_prompt_template("Stay calm as the {role} during {phase}."),
            )
            .node(Node::new("intro", "Intro", "doctor").with_description("Greet the patient."))
            .node(Node::new("triage", "Triage", "nurse").with_description("Take vitals."))
            .build()
            .unwrap()
    }

    fn entry(role: &str, content: &str) -> ConversationEntry {
        ConversationEntry {
            node_id: "n".into(),
            role_id: role.into(),
            content: content.into(),
        }
    }

    #[test]
    fn test_empty_history_prompt() {
        let p = process();
        let ctx = ContextBuilder::build(&p, p.start_node(), &[]);
        assert_eq!(
            ctx.system_prompt,
            "You are simulating a Doctor in a process called Clinic Visit. Greet the patient."
        );
        assert_eq!(
            ctx.user_prompt,
            "You are now in the 'Intro' phase.\nGreet the patient.\n\nPrevious conversation:\n\
             No previous conversation.\n\nPlease respond based on your role and the current phase."
        );
    }

    #[test]
    fn test_transcript_numbering() {
        let p = process();
        let history = vec![
            entry("doctor", "Hello"),
            entry("learner", "Hi doctor"),
            entry("doctor", "What seems to be the problem?"),
        ];
        let ctx = ContextBuilder::build(&p, p.start_node(), &history);
        assert!(!ctx.user_prompt.contains(NO_HISTORY));
        assert!(ctx.user_prompt.contains("1. doctor: Hello\n2. learner: Hi doctor\n3. doctor: What"));

        let numbered = ctx
            .user_prompt
            .lines()
            .filter(|l| l.chars().next().is_some_and(|c| c.is_ascii_digit()))
            .count();
        assert_eq!(numbered, 3);
    }

    #[test]
    fn test_build_is_pure() {
        let p = process();
        let history = vec![entry("doctor", "Hello")];
        let node = p.node("triage").unwrap();
        assert_eq!(
            ContextBuilder::build(&p, node, &history),
            ContextBuilder::build(&p, node, &history)
        );
    }

    #[test]
    fn test_system_prompt_template_appended() {
        let p = process();
        let ctx = ContextBuilder::build(&p, p.node("triage").unwrap(), &[]);
        assert!(ctx
            .system_prompt
            .starts_with("You are simulating a Nurse in a process called Clinic Visit. Take vitals."));
        assert!(ctx.system_prompt.ends_with("Stay calm as the Nurse during Triage."));
    }
}
