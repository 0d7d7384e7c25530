//! Graphviz rendering of a model.
//!
//! Composite and parallel states become clusters, each region of a parallel
//! state a dashed sub-cluster. Edges into or out of a compound state attach
//! to an invisible anchor node inside its cluster.

use crate::description::StateKind;
use crate::model::{Model, RegionId, StateId, TransitionNode};

/// Renders `model` as a Graphviz digraph.
pub fn to_dot(model: &Model) -> String {
    let mut out = String::new();
    out.push_str(&format!("digraph \"{}\" {{\n", escape(model.name())));
    out.push_str("  compound=true;\n");
    out.push_str(&format!(
        "  label=\"{} ({})\";\n",
        escape(model.name()),
        escape(&model.model_version())
    ));
    out.push_str("  node [shape=box, style=rounded];\n");

    write_region(model, model.root(), 1, &mut out);
    for transition in model.transitions() {
        write_transition(model, transition, &mut out);
    }

    out.push_str("}\n");
    out
}

fn write_region(model: &Model, region: RegionId, depth: usize, out: &mut String) {
    for &state in &model.region(region).states {
        write_state(model, state, depth, out);
    }
}

fn write_state(model: &Model, id: StateId, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    let state = model.state(id);
    let node = node_id(id);

    if !state.is_compound() {
        let attrs = match state.kind {
            StateKind::Initial => "shape=point, width=0.15, label=\"\"".to_string(),
            StateKind::Final => format!("shape=doublecircle, style=solid, label=\"{}\"", escape(&state.name)),
            _ => format!("label=\"{}\"", escape(&state.name)),
        };
        out.push_str(&format!("{}{} [{}];\n", indent, node, attrs));
        return;
    }

    out.push_str(&format!("{}subgraph cluster_{} {{\n", indent, node));
    out.push_str(&format!("{}  label=\"{}\";\n", indent, escape(&state.name)));
    out.push_str(&format!("{}  {} [shape=point, style=invis, label=\"\"];\n", indent, node));
    if state.kind == StateKind::Parallel {
        for &region in &state.regions {
            out.push_str(&format!("{}  subgraph cluster_r{} {{\n", indent, region.index()));
            out.push_str(&format!(
                "{}    label=\"{}\";\n{}    style=dashed;\n",
                indent,
                escape(&model.region(region).name),
                indent
            ));
            write_region(model, region, depth + 2, out);
            out.push_str(&format!("{}  }}\n", indent));
        }
    } else {
        for &region in &state.regions {
            write_region(model, region, depth + 1, out);
        }
    }
    out.push_str(&format!("{}}}\n", indent));
}

fn write_transition(model: &Model, transition: &TransitionNode, out: &mut String) {
    let mut label = transition.event.clone().unwrap_or_default();
    if let Some(guard) = &transition.guard {
        if !guard.is_always_true() {
            if !label.is_empty() {
                label.push(' ');
            }
            label.push_str(&format!("[{}]", guard.source()));
        }
    }

    if transition.targets.is_empty() {
        write_edge(model, transition.source, transition.source, &label, Some("dotted"), out);
    }
    for &target in &transition.targets {
        write_edge(model, transition.source, target, &label, None, out);
    }
    for &target in &transition.else_targets {
        write_edge(model, transition.source, target, "[else]", Some("dashed"), out);
    }
}

fn write_edge(model: &Model, from: StateId, to: StateId, label: &str, style: Option<&str>, out: &mut String) {
    let mut attrs = vec![format!("label=\"{}\"", escape(label))];
    if model.state(from).is_compound() {
        attrs.push(format!("ltail=cluster_{}", node_id(from)));
    }
    if model.state(to).is_compound() && from != to {
        attrs.push(format!("lhead=cluster_{}", node_id(to)));
    }
    if let Some(style) = style {
        attrs.push(format!("style={}", style));
    }
    out.push_str(&format!("  {} -> {} [{}];\n", node_id(from), node_id(to), attrs.join(", ")));
}

fn node_id(id: StateId) -> String {
    format!("s{}", id.index())
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}
