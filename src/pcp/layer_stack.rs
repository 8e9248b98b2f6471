use super::{MapExpression, MapFunction};
use crate::sdf;
use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::sync::Arc;

/// The composed expression variables of a layer stack, plus the identifier
/// of the layer stack that provided them.
///
/// When a referenced layer stack authors no variables of its own it simply
/// adopts the referencing stack's variables object, source included. Layer
/// stacks can then be shared across prim indexes when variables are
/// sparsely authored, which is the expected case.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionVariables {
	pub source: String,
	pub variables: IndexMap<String, String>,
}

impl ExpressionVariables {
	fn empty() -> Self {
		Self {
			source: String::new(),
			variables: IndexMap::new(),
		}
	}
}

/// Represents a stack of layers that contribute opinions to composition.
///
/// The stack lists layers strongest first: session layers (if any), then
/// the root layer, then sublayers in depth-first order. The stack also
/// precomputes the relocation maps and composed expression variables its
/// layers author.
#[derive(Debug)]
pub struct LayerStack {
	/// Layers in the stack, ordered from strongest (index 0) to weakest.
	layers: Vec<Arc<sdf::Layer>>,
	layer_offsets: Vec<sdf::Retiming>,
	root_layer: Arc<sdf::Layer>,

	relocates_source_to_target: BTreeMap<sdf::Path, sdf::Path>,
	relocates_target_to_source: BTreeMap<sdf::Path, sdf::Path>,
	incremental_relocates_source_to_target: BTreeMap<sdf::Path, sdf::Path>,
	incremental_relocates_target_to_source: BTreeMap<sdf::Path, sdf::Path>,

	expression_variables: ExpressionVariables,
}

impl LayerStack {
	pub fn new(root_layer: Arc<sdf::Layer>) -> Arc<Self> {
		Self::compute(None, root_layer, None)
	}

	/// A layer stack with a session layer stacked over the root layer.
	pub fn with_session(session_layer: Arc<sdf::Layer>, root_layer: Arc<sdf::Layer>) -> Arc<Self> {
		Self::compute(Some(session_layer), root_layer, None)
	}

	/// Compute the layer stack for a referenced layer, composing the
	/// referencing stack's expression variables over this stack's own.
	pub fn for_referenced_layer(
		root_layer: Arc<sdf::Layer>,
		override_variables: &ExpressionVariables,
	) -> Arc<Self> {
		Self::compute(None, root_layer, Some(override_variables))
	}

	fn compute(
		session_layer: Option<Arc<sdf::Layer>>,
		root_layer: Arc<sdf::Layer>,
		override_variables: Option<&ExpressionVariables>,
	) -> Arc<Self> {
		let mut stack = Self {
			layers: Vec::new(),
			layer_offsets: Vec::new(),
			root_layer: root_layer.clone(),
			relocates_source_to_target: BTreeMap::new(),
			relocates_target_to_source: BTreeMap::new(),
			incremental_relocates_source_to_target: BTreeMap::new(),
			incremental_relocates_target_to_source: BTreeMap::new(),
			expression_variables: ExpressionVariables::empty(),
		};

		if let Some(session) = session_layer {
			stack.add_layer_tree(session, sdf::Retiming::default());
		}
		stack.add_layer_tree(root_layer, sdf::Retiming::default());
		stack.compute_relocates();
		stack.compute_expression_variables(override_variables);
		Arc::new(stack)
	}

	fn add_layer_tree(&mut self, layer: Arc<sdf::Layer>, offset: sdf::Retiming) {
		self.layers.push(layer.clone());
		self.layer_offsets.push(offset);

		let sub_layers = layer.sub_layer_paths();
		let sub_layer_offsets = layer.sub_layer_offsets();

		for (i, sub_layer_path) in sub_layers.iter().enumerate() {
			let sub_offset = sub_layer_offsets
				.get(i)
				.copied()
				.unwrap_or_default();

			// Sublayers that fail to resolve contribute nothing; layer I/O
			// diagnostics belong to the layer stack cache, not this crate.
			let Some(sub_layer) = sdf::Layer::find_or_open(sub_layer_path) else {
				continue;
			};

			self.add_layer_tree(sub_layer, offset * sub_offset);
		}
	}

	fn compute_relocates(&mut self) {
		for layer in &self.layers {
			for relocate in layer.relocates() {
				self.incremental_relocates_source_to_target
					.entry(relocate.source.clone())
					.or_insert_with(|| relocate.target.clone());
				self.incremental_relocates_target_to_source
					.entry(relocate.target.clone())
					.or_insert_with(|| relocate.source.clone());
			}
		}

		// The fully-combined maps collapse chained relocations (A -> B,
		// B -> C) into their end-to-end form (A -> C).
		for (source, target) in &self.incremental_relocates_source_to_target {
			let mut final_target = target.clone();
			let mut hops = 0;
			while let Some(next) = self.incremental_relocates_source_to_target.get(&final_target) {
				final_target = next.clone();
				hops += 1;
				if hops > self.incremental_relocates_source_to_target.len() {
					break;
				}
			}
			self.relocates_source_to_target
				.insert(source.clone(), final_target.clone());
			self.relocates_target_to_source
				.entry(final_target)
				.or_insert_with(|| source.clone());
		}
	}

	fn compute_expression_variables(&mut self, override_variables: Option<&ExpressionVariables>) {
		let own = self.root_layer.expression_variables();

		match override_variables {
			Some(overrides) if own.is_empty() => {
				// Nothing authored locally; adopt the overriding object
				// wholesale so equivalent stacks stay shared.
				self.expression_variables = overrides.clone();
			}
			Some(overrides) => {
				let mut variables = own;
				for (name, value) in &overrides.variables {
					variables.insert(name.clone(), value.clone());
				}
				self.expression_variables = ExpressionVariables {
					source: self.root_layer.identifier().to_string(),
					variables,
				};
			}
			None => {
				self.expression_variables = ExpressionVariables {
					source: self.root_layer.identifier().to_string(),
					variables: own,
				};
			}
		}
	}
}

impl LayerStack {
	pub fn layers(&self) -> &[Arc<sdf::Layer>] {
		&self.layers
	}

	pub fn layer_offsets(&self) -> &[sdf::Retiming] {
		&self.layer_offsets
	}

	/// The stack's root layer. Session layers, when present, precede it.
	pub fn root_layer(&self) -> &Arc<sdf::Layer> {
		&self.root_layer
	}

	pub fn identifier(&self) -> &str {
		self.root_layer.identifier()
	}

	pub fn has_layer(&self, layer: &Arc<sdf::Layer>) -> bool {
		self.layers.iter().any(|l| Arc::ptr_eq(l, layer))
	}

	pub fn timecodes_per_second(&self) -> f64 {
		self.root_layer.timecodes_per_second()
	}

	pub fn expression_variables(&self) -> &ExpressionVariables {
		&self.expression_variables
	}

	pub fn relocates_source_to_target(&self) -> &BTreeMap<sdf::Path, sdf::Path> {
		&self.relocates_source_to_target
	}

	pub fn relocates_target_to_source(&self) -> &BTreeMap<sdf::Path, sdf::Path> {
		&self.relocates_target_to_source
	}

	/// The per-step relocation maps. Unlike the fully-combined maps these
	/// retain every intermediate site of nested relocation chains, which
	/// the relocation evaluators need to examine all sources of opinions.
	pub fn incremental_relocates_source_to_target(&self) -> &BTreeMap<sdf::Path, sdf::Path> {
		&self.incremental_relocates_source_to_target
	}

	pub fn incremental_relocates_target_to_source(&self) -> &BTreeMap<sdf::Path, sdf::Path> {
		&self.incremental_relocates_target_to_source
	}

	/// Returns true if `path` sits at or below a relocation source in
	/// this stack. Such sites may not contribute local opinions (the
	/// salted earth policy).
	pub fn path_is_at_or_under_relocates_source(&self, path: &sdf::Path) -> bool {
		path.ancestors_range()
			.any(|ancestor| self.relocates_source_to_target.contains_key(&ancestor))
	}

	/// A map expression applying the relocations that affect namespace at
	/// and below `path`.
	pub fn relocates_expression_for_path(&self, path: &sdf::Path) -> MapExpression {
		let mut pairs = Vec::new();
		for (source, target) in &self.incremental_relocates_source_to_target {
			if target.has_prefix(path) || path.has_prefix(target) {
				pairs.push((source.clone(), target.clone()));
			}
		}
		if pairs.is_empty() {
			return MapExpression::identity();
		}
		pairs.push((
			sdf::Path::absolute_root_path(),
			sdf::Path::absolute_root_path(),
		));
		MapExpression::constant(MapFunction::new(pairs, sdf::Retiming::default()))
	}
}

/// A site of scene description: a layer stack and a path within it.
#[derive(Debug, Clone)]
pub struct Site {
	pub layer_stack: Arc<LayerStack>,
	pub path: sdf::Path,
}

impl Site {
	pub fn new(layer_stack: Arc<LayerStack>, path: sdf::Path) -> Self {
		Self { layer_stack, path }
	}
}

impl PartialEq for Site {
	fn eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.layer_stack, &other.layer_stack) && self.path == other.path
	}
}

impl Eq for Site {}

impl std::fmt::Display for Site {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "@{}@<{}>", self.layer_stack.identifier(), self.path)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn p(s: &str) -> sdf::Path {
		sdf::Path::from(s)
	}

	#[test]
	fn sublayer_order_is_depth_first() {
		let root = sdf::Layer::create("ls_root.usda");
		let sub_a = sdf::Layer::create("ls_a.usda");
		sdf::Layer::create("ls_a_child.usda");
		sdf::Layer::create("ls_b.usda");
		root.add_sub_layer("ls_a.usda", sdf::Retiming::default());
		root.add_sub_layer("ls_b.usda", sdf::Retiming::default());
		sub_a.add_sub_layer("ls_a_child.usda", sdf::Retiming::default());

		let stack = LayerStack::new(root);
		let identifiers: Vec<&str> =
			stack.layers().iter().map(|l| l.identifier()).collect();
		assert_eq!(
			identifiers,
			vec!["ls_root.usda", "ls_a.usda", "ls_a_child.usda", "ls_b.usda"]
		);
	}

	#[test]
	fn chained_relocates_collapse_in_combined_map() {
		let root = sdf::Layer::create("ls_reloc.usda");
		root.add_relocate(p("/A/B"), p("/A/C"));
		root.add_relocate(p("/A/C"), p("/A/D"));

		let stack = LayerStack::new(root);
		assert_eq!(
			stack.relocates_source_to_target().get(&p("/A/B")),
			Some(&p("/A/D"))
		);
		assert_eq!(
			stack.incremental_relocates_target_to_source().get(&p("/A/C")),
			Some(&p("/A/B"))
		);
		assert!(stack.path_is_at_or_under_relocates_source(&p("/A/B")));
		assert!(stack.path_is_at_or_under_relocates_source(&p("/A/B/Deep")));
		assert!(!stack.path_is_at_or_under_relocates_source(&p("/A/D")));
	}

	#[test]
	fn referenced_stack_adopts_sparse_variables() {
		let root = sdf::Layer::create("ls_vars_root.usda");
		root.set_expression_variable("WHICH", "blue");
		let child = sdf::Layer::create("ls_vars_child.usda");

		let root_stack = LayerStack::new(root);
		let child_stack = LayerStack::for_referenced_layer(
			child,
			root_stack.expression_variables(),
		);

		// The child authored nothing, so it shares the override source.
		assert_eq!(
			child_stack.expression_variables().source,
			"ls_vars_root.usda"
		);
		assert_eq!(
			child_stack.expression_variables().variables.get("WHICH"),
			Some(&"blue".to_string())
		);
	}
}
