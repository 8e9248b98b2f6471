use super::graph::INVALID_NODE_INDEX;
use super::{ArcType, PrimIndex, PrimIndexGraph};
use serde::{Deserialize, Serialize};
use std::io::Write;

/// A compact, serializable picture of one prim index node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
	pub arc_type: ArcType,
	pub layer_stack: String,
	pub path: String,
	pub parent: Option<u16>,
	pub origin: Option<u16>,
	pub inert: bool,
	pub has_specs: bool,
}

/// A serializable picture of a prim index graph: topology, arc kinds and
/// site tuples, in arena order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GraphSnapshot {
	pub nodes: Vec<NodeSnapshot>,
}

/// Capture the graph of a prim index as a snapshot.
pub fn dump_graph(index: &PrimIndex) -> GraphSnapshot {
	let graph = &index.graph;
	let mut nodes = Vec::with_capacity(graph.node_count());
	for index in 0..graph.node_count() as u16 {
		let node = graph.node(index);
		nodes.push(NodeSnapshot {
			arc_type: node.arc_type,
			layer_stack: node.layer_stack.identifier().to_string(),
			path: node.site_path.to_string(),
			parent: (node.parent_index != INVALID_NODE_INDEX).then_some(node.parent_index),
			origin: (node.origin_index != INVALID_NODE_INDEX).then_some(node.origin_index),
			inert: node.is_inert(),
			has_specs: node.has_specs(),
		});
	}
	GraphSnapshot { nodes }
}

/// Reload a snapshot from its serialized form.
pub fn load_graph(serialized: &str) -> Result<GraphSnapshot, serde_json::Error> {
	serde_json::from_str(serialized)
}

/// Serialize a snapshot.
pub fn save_graph(snapshot: &GraphSnapshot) -> Result<String, serde_json::Error> {
	serde_json::to_string_pretty(snapshot)
}

pub fn dump_dot_graph(index: &PrimIndex, writer: &mut dyn Write) -> std::io::Result<()> {
	writeln!(writer, "digraph PrimIndex {{")?;
	if index.is_valid() {
		write_graph(writer, &index.graph, 0)?;
	}
	writeln!(writer, "}}")?;
	Ok(())
}

fn write_graph(
	writer: &mut dyn Write,
	graph: &PrimIndexGraph,
	node_idx: u16,
) -> std::io::Result<()> {
	let node = graph.node(node_idx);

	let node_label = format!(
		"@{}@<{}> ({})",
		node.layer_stack.identifier(),
		node.site_path,
		node_idx
	);

	writeln!(
		writer,
		"\t{} [label=\"{}\", shape=\"box\"{}];",
		node_idx,
		node_label,
		if node.is_inert() { ", style=\"dotted\"" } else { "" }
	)?;

	for child_idx in graph.children(node_idx) {
		let child = graph.node(child_idx);

		let (color, label) = match child.arc_type {
			ArcType::Root => ("black", "root"),
			ArcType::Inherit => ("green", "inherit"),
			ArcType::Variant => ("orange", "variant"),
			ArcType::Relocate => ("purple", "relocate"),
			ArcType::Reference => ("red", "reference"),
			ArcType::Payload => ("indigo", "payload"),
			ArcType::Specialize => ("sienna", "specialize"),
		};

		writeln!(
			writer,
			"\t{} -> {} [label=\"{}\", color={}];",
			node_idx, child_idx, label, color
		)?;

		write_graph(writer, graph, child_idx)?;
	}

	Ok(())
}
