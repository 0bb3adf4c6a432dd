use tracing::{debug, warn};

use agir_core::process::{Node, ProcessDefinition, Transition};

/// Picks the next node to visit.
///
/// The first declared transition out of the current node wins; conditions are
/// descriptive and never evaluated.
pub struct TransitionRouter;

impl TransitionRouter {
    pub fn next_node<'a>(process: &'a ProcessDefinition, current: &Node) -> Option<&'a Node> {
        follow(process.transitions(), process.nodes(), current)
    }
}

/// Route over raw parts. A target with no matching node ends traversal;
/// `ProcessBuilder::build` rejects such edges, so only hand-assembled parts hit it.
fn follow<'a>(transitions: &[Transition], nodes: &'a [Node], current: &Node) -> Option<&'a Node> {
    let Some(transition) = transitions.iter().find(|t| t.from == current.name) else {
        debug!(node = %current.name, "No outgoing transition, process complete");
        return None;
    };

    let next = nodes.iter().find(|n| n.name == transition.to);
    if next.is_none() {
        warn!(
            from = %transition.from,
            to = %transition.to,
            "Transition target not found, ending traversal"
        );
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use agir_core::process::{Learner, Role, Transition};

    fn process() -> ProcessDefinition {
        ProcessDefinition::builder("Branching")
            .learner(Learner::new("alice"))
            .role(Role::new("coach", "Coach"))
            .node(Node::new("a", "A", "coach"))
            .node(Node::new("b", "B", "coach"))
            .node(Node::new("c", "C", "coach"))
            .transition(Transition::new("A", "C").with_condition("learner is confident"))
            .transition(Transition::new("A", "B").with_condition("learner is unsure"))
            .transition(Transition::new("C", "B"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_first_declared_edge_wins() {
        let p = process();
        let next = TransitionRouter::next_node(&p, p.node("a").unwrap()).unwrap();
        assert_eq!(next.name, "C");
    }

    #[test]
    fn test_terminal_node() {
        let p = process();
        assert!(TransitionRouter::next_node(&p, p.node("b").unwrap()).is_none());
    }

    #[test]
    fn test_deterministic() {
        let p = process();
        let node = p.node("c").unwrap();
        let first = TransitionRouter::next_node(&p, node).map(|n| n.id.clone());
        for _ in 0..10 {
            assert_eq!(TransitionRouter::next_node(&p, node).map(|n| n.id.clone()), first);
        }
    }

    #[test]
    fn test_dangling_target_ends_traversal() {
        let nodes = vec![Node::new("a", "A", "coach"), Node::new("b", "B", "coach")];
        let transitions = vec![Transition::new("A", "Gone"), Transition::new("A", "B")];
        // The first edge wins even when its target is missing
        assert!(follow(&transitions, &nodes, &nodes[0]).is_none());

        let transitions = vec![Transition::new("A", "B")];
        assert_eq!(follow(&transitions, &nodes, &nodes[0]).unwrap().id, "b");
    }

    #[test]
    fn test_unknown_current_node_has_no_successor() {
        let p = process();
        let stranger = Node::new("z", "Z", "coach");
        assert!(TransitionRouter::next_node(&p, &stranger).is_none());
    }
}
