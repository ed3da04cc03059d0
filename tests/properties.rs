//! Property suites for the validator and the template engine.

use proptest::prelude::*;
use serde_json::{json, Value};
use strand_workflow_engine::model::Workflow;
use strand_workflow_engine::template;
use strand_workflow_engine::validation::{self, Violation};

fn node_json(id: &str, terminal: bool) -> Value {
    if terminal {
        json!({"id": id, "blockType": "EMAIL", "config": {"to": "x@y.z", "subject": "s"}})
    } else {
        json!({"id": id, "blockType": "HTTP", "config": {"url": "http://x"}})
    }
}

/// Random DAG shaped to satisfy every non-structural invariant: node 0 is
/// the single entry, every node hangs off a random earlier parent (spanning
/// tree), plus extra forward edges. Forward-only edges cannot form a cycle.
fn arb_dag() -> impl Strategy<Value = Workflow> {
    (2usize..12).prop_flat_map(|n| {
        let parents: Vec<_> = (1..n).map(|i| 0..i).collect();
        let extras = proptest::collection::vec((0usize..n, 0usize..n), 0..8);
        (parents, extras).prop_map(move |(parents, extras)| {
            let mut edges: Vec<(usize, usize)> =
                parents.iter().enumerate().map(|(i, &p)| (p, i + 1)).collect();
            for (a, b) in extras {
                let (a, b) = (a.min(b), a.max(b));
                if a != b && !edges.contains(&(a, b)) {
                    edges.push((a, b));
                }
            }
            let has_children: Vec<bool> = (0..n)
                .map(|i| edges.iter().any(|(s, _)| *s == i))
                .collect();
            let nodes: Vec<Value> = (0..n)
                .map(|i| node_json(&format!("n{:02}", i), !has_children[i]))
                .collect();
            let edges: Vec<Value> = edges
                .iter()
                .enumerate()
                .map(|(k, (s, t))| {
                    json!({
                        "id": format!("e{:02}", k),
                        "source": format!("n{:02}", s),
                        "target": format!("n{:02}", t),
                    })
                })
                .collect();
            serde_json::from_value(json!({"name": "gen", "nodes": nodes, "edges": edges}))
                .unwrap()
        })
    })
}

proptest! {
    /// Every accepted workflow admits a topological order that respects
    /// every edge and covers every node exactly once.
    #[test]
    fn accepted_workflows_have_a_topological_order(workflow in arb_dag()) {
        prop_assert!(validation::validate(&workflow).is_ok());
        let order = validation::topological_order(&workflow).unwrap();
        prop_assert_eq!(order.len(), workflow.nodes.len());
        let position: std::collections::HashMap<_, _> =
            order.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();
        for edge in &workflow.edges {
            prop_assert!(position[&edge.source] < position[&edge.target]);
        }
    }

    /// The order is deterministic across reruns.
    #[test]
    fn topological_order_is_stable(workflow in arb_dag()) {
        let first = validation::topological_order(&workflow).unwrap();
        let second = validation::topological_order(&workflow).unwrap();
        prop_assert_eq!(first, second);
    }

    /// Closing any back edge over a chain produces a CYCLE violation naming
    /// a node on the cycle.
    #[test]
    fn back_edge_produces_cycle_violation(n in 3usize..10, back in 0usize..3) {
        let back = back.min(n - 2);
        let nodes: Vec<Value> = (0..n).map(|i| node_json(&format!("n{:02}", i), false)).collect();
        let mut edges: Vec<Value> = (1..n)
            .map(|i| json!({
                "id": format!("e{:02}", i),
                "source": format!("n{:02}", i - 1),
                "target": format!("n{:02}", i),
            }))
            .collect();
        edges.push(json!({
            "id": "back",
            "source": format!("n{:02}", n - 1),
            "target": format!("n{:02}", back),
        }));
        let workflow: Workflow =
            serde_json::from_value(json!({"name": "cyc", "nodes": nodes, "edges": edges})).unwrap();
        let violations = validation::validate(&workflow).unwrap_err();
        let cycle_node = violations.iter().find_map(|v| match v {
            Violation::Cycle { node_id } => Some(node_id.clone()),
            _ => None,
        });
        prop_assert!(cycle_node.is_some());
        // the named node really sits on the cycle [back, n)
        let named: usize = cycle_node.unwrap()[1..].parse().unwrap();
        prop_assert!((back..n).contains(&named));
        prop_assert!(validation::topological_order(&workflow).is_err());
    }
}

fn arb_inputs() -> impl Strategy<Value = Value> {
    let key = "[a-c]{1}";
    let scalar = prop_oneof![
        any::<i64>().prop_map(|n| json!(n)),
        any::<bool>().prop_map(|b| json!(b)),
        "[a-z ]{0,12}".prop_map(|s| json!(s)),
    ];
    proptest::collection::hash_map(key, scalar, 0..4).prop_map(|m| {
        let map: serde_json::Map<String, Value> = m.into_iter().collect();
        Value::Object(map)
    })
}

fn arb_template() -> impl Strategy<Value = String> {
    proptest::collection::vec(
        prop_oneof![
            "[a-z ,.!?]{0,10}".prop_map(|s| s),
            "[a-d]{1}".prop_map(|k| format!("{{{{{}}}}}", k)),
            "[a-d]\\.[a-d]".prop_map(|p| format!("{{{{{}}}}}", p)),
        ],
        0..6,
    )
    .prop_map(|parts| parts.concat())
}

proptest! {
    /// Rendering is a fixpoint once fully resolved: rendering the rendered
    /// string again changes nothing (inputs carry no template syntax).
    #[test]
    fn template_render_is_idempotent(template in arb_template(), inputs in arb_inputs()) {
        let once = template::render_str(&template, &inputs);
        let twice = template::render_str(&once, &inputs);
        prop_assert_eq!(once, twice);
    }

    /// Rendering never invents placeholders: a template without `{{` passes
    /// through byte for byte.
    #[test]
    fn plain_strings_pass_through(text in "[a-z ,.!?0-9]{0,40}", inputs in arb_inputs()) {
        prop_assert_eq!(template::render_str(&text, &inputs), text);
    }
}
