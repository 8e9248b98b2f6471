use super::compose_site::{
	compose_site_child_names, compose_site_custom_field, compose_site_has_prim_specs,
	compose_site_instanceable, compose_site_property_names, evaluate_expression_string,
};
use super::error::Error;
use super::graph::{GraphError, NodeArc, PrimIndexGraph, INVALID_NODE_INDEX};
use super::layer_stack::{LayerStack, Site};
use super::{builder, ArcType};
use crate::{sdf, tf};
use indexmap::IndexMap;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, RwLock};

/// Mapping from variant set name to an ordered list of preferred
/// selections, strongest preference first.
pub type VariantFallbackMap = IndexMap<String, Vec<String>>;

/// How the payload gate decided whether to include payloads for the prim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadState {
	#[default]
	NoPayload,
	IncludedByIncludeSet,
	ExcludedByIncludeSet,
	IncludedByPredicate,
	ExcludedByPredicate,
}

/// The caches a prim index build may consult: the memoized prim indexes of
/// sibling builds, and layer muting state. All methods may be called
/// concurrently from multiple builders.
pub trait PrimIndexCache {
	/// The layer stack this cache memoizes prim indexes for.
	fn layer_stack(&self) -> Arc<LayerStack>;

	/// If the asset path names a muted layer, returns its canonical muted
	/// identifier.
	fn muted_layer(&self, asset_path: &str) -> Option<String>;

	/// The inputs the cache's memoized indexes were computed with, for
	/// equivalence checking against the current build's inputs.
	fn inputs_are_equivalent_to(&self, inputs: &PrimIndexInputs) -> bool;

	/// The memoized prim index for `path`, computing it if necessary.
	fn computed_prim_index(&self, path: &sdf::Path) -> Option<PrimIndex>;
}

/// A file format that generates layer arguments from composed scene
/// description. Only payload arcs consult dynamic file formats.
pub trait DynamicFileFormat {
	/// The format name recorded in dependency output.
	fn format_name(&self) -> &str;

	/// The asset path extension this format handles.
	fn extension(&self) -> &str;

	/// Compose arguments for opening `asset_path`, reading composed fields
	/// through `context`. Returns opaque context data for dependency
	/// tracking.
	fn compose_arguments(
		&self,
		asset_path: &str,
		context: &mut DynamicFormatContext,
	) -> Option<String>;
}

/// Lets a dynamic file format read composed field values at the site that
/// introduced a payload, recording everything consulted for dependency
/// tracking.
pub struct DynamicFormatContext<'a> {
	pub(crate) layer_stack: &'a LayerStack,
	pub(crate) path: &'a sdf::Path,
	pub(crate) field_names: Vec<String>,
	pub(crate) attribute_names: Vec<String>,
}

impl DynamicFormatContext<'_> {
	pub fn compose_field_value(&mut self, field: &str) -> Option<String> {
		if !self.field_names.iter().any(|f| f == field) {
			self.field_names.push(field.to_string());
		}
		compose_site_custom_field(self.layer_stack, self.path, field)
	}

	pub fn compose_attribute_default(&mut self, attribute: &str) -> Option<String> {
		if !self.attribute_names.iter().any(|a| a == attribute) {
			self.attribute_names.push(attribute.to_string());
		}
		compose_site_custom_field(self.layer_stack, self.path, attribute)
	}
}

/// Inputs controlling how a prim index is built.
pub struct PrimIndexInputs<'a> {
	pub variant_fallbacks: VariantFallbackMap,
	/// Paths whose payloads load; `None` means payloads never load.
	pub included_payloads: Option<&'a RwLock<HashSet<sdf::Path>>>,
	/// When set, overrides the include set.
	pub include_payload_predicate: Option<&'a (dyn Fn(&sdf::Path) -> bool + Sync)>,
	pub cull: bool,
	/// When true, relocations, permissions, symmetry and prim stack
	/// retention are disabled.
	pub usd: bool,
	/// Opaque values threaded to layer I/O.
	pub file_format_target: String,
	pub path_resolver_context: String,
	pub dynamic_file_formats: &'a [&'a dyn DynamicFileFormat],
	pub cache: Option<&'a dyn PrimIndexCache>,
	pub parent_index: Option<&'a PrimIndex>,
}

impl Default for PrimIndexInputs<'_> {
	fn default() -> Self {
		Self {
			variant_fallbacks: VariantFallbackMap::new(),
			included_payloads: None,
			include_payload_predicate: None,
			cull: true,
			usd: false,
			file_format_target: String::new(),
			path_resolver_context: String::new(),
			dynamic_file_formats: &[],
			cache: None,
			parent_index: None,
		}
	}
}

impl PrimIndexInputs<'_> {
	/// Equivalence for cache reuse considers the variant fallbacks, the
	/// included payload set and culling only.
	pub fn is_equivalent_to(&self, other: &PrimIndexInputs) -> bool {
		let same_payload_set = match (self.included_payloads, other.included_payloads) {
			(Some(a), Some(b)) => std::ptr::eq(a, b),
			(None, None) => true,
			_ => false,
		};
		self.variant_fallbacks == other.variant_fallbacks
			&& same_payload_set
			&& self.cull == other.cull
	}
}

/// A record of a payload whose file format consulted composed fields,
/// retained so downstream change processing can tell when those fields
/// change.
#[derive(Debug, Clone, PartialEq)]
pub struct DynamicFileFormatDependency {
	pub file_format: String,
	pub context_data: Option<String>,
	pub field_names: Vec<String>,
	pub attribute_names: Vec<String>,
}

/// A record of a culled node, retained for downstream change processing
/// after the node itself is dropped from the finalized graph.
#[derive(Debug, Clone)]
pub struct CulledDependency {
	pub layer_stack: Arc<LayerStack>,
	pub site_path: sdf::Path,
}

/// One entry of the flattened prim stack: a node and a layer within that
/// node's layer stack holding a prim spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressedSite {
	pub node_index: u16,
	pub layer_index: u16,
}

/// An index of all the sites of scene description that contribute
/// opinions to a specific prim, under composition semantics.
#[derive(Debug, Clone, Default)]
pub struct PrimIndex {
	pub graph: PrimIndexGraph,
	pub(crate) prim_stack: Vec<CompressedSite>,
	pub(crate) local_errors: Vec<Error>,
}

impl PrimIndex {
	pub fn is_valid(&self) -> bool {
		self.graph.node_count() > 0
	}

	pub fn path(&self) -> sdf::Path {
		if self.is_valid() {
			self.graph.root_path().clone()
		} else {
			sdf::Path::empty_path()
		}
	}

	pub fn root_site(&self) -> Site {
		self.graph.node(0).site()
	}

	pub fn has_any_payloads(&self) -> bool {
		self.graph.has_payloads()
	}

	pub fn is_usd(&self) -> bool {
		self.graph.is_usd()
	}

	pub fn is_instanceable(&self) -> bool {
		self.graph.is_instanceable()
	}

	/// Errors local to this prim index, in discovery order.
	pub fn local_errors(&self) -> &[Error] {
		&self.local_errors
	}

	pub fn has_specs(&self) -> bool {
		// Prim stacks are not retained in USD mode.
		if !self.is_usd() {
			return !self.prim_stack.is_empty();
		}
		self.graph
			.node_range_strong_to_weak()
			.into_iter()
			.any(|n| self.graph.node(n).has_specs())
	}

	/// The flattened prim stack: every (layer, path) contributing specs,
	/// in strength order. Empty in USD mode.
	pub fn prim_stack(&self) -> Vec<(Arc<sdf::Layer>, sdf::Path)> {
		self.prim_stack
			.iter()
			.map(|site| {
				let node = self.graph.node(site.node_index);
				(
					node.layer_stack.layers()[site.layer_index as usize].clone(),
					node.site_path.clone(),
				)
			})
			.collect()
	}

	/// The node through which opinions authored at (layer, path) enter
	/// this prim index, if any.
	pub fn node_providing_spec(&self, layer: &Arc<sdf::Layer>, path: &sdf::Path) -> Option<u16> {
		self.graph
			.node_range_strong_to_weak()
			.into_iter()
			.find(|&index| {
				let node = self.graph.node(index);
				node.can_contribute_specs()
					&& node.site_path == *path
					&& node.layer_stack.has_layer(layer)
			})
	}

	/// Compose the authored variant selections over the prim stack,
	/// strongest opinion per set.
	pub fn compose_authored_variant_selections(&self) -> sdf::VariantSelectionMap {
		let mut result = sdf::VariantSelectionMap::new();
		for site in &self.prim_stack {
			let node = self.graph.node(site.node_index);
			let layer = &node.layer_stack.layers()[site.layer_index as usize];
			let Some(spec) = layer.prim_spec(&node.site_path) else {
				continue;
			};
			let Some(selections) = spec.variant_selection else {
				continue;
			};
			for (vset, vsel) in selections {
				let evaluated =
					evaluate_expression_string(&vsel, &node.layer_stack, &mut Vec::new());
				result.entry(vset).or_insert(evaluated);
			}
		}
		result
	}

	/// The selection this index applied for the named variant set, if a
	/// variant arc for it was expanded.
	pub fn selection_applied_for_variant_set(&self, variant_set: &str) -> Option<String> {
		self.graph
			.node_range_strong_to_weak()
			.into_iter()
			.find_map(|index| {
				let node = self.graph.node(index);
				match node.site_path.variant_selection() {
					Some((vset, vsel)) if vset.as_str() == variant_set => {
						Some(vsel.to_string())
					}
					_ => None,
				}
			})
	}

	/// Walk the graph weak-to-strong, composing prim child names.
	/// Accounts for spec children in each layer, list-editing statements,
	/// and relocations. Returns the composed name order; `prohibited`
	/// collects relocation source names that must not appear as children.
	pub fn compute_prim_child_names(
		&self,
		name_order: &mut Vec<tf::Token>,
		prohibited: &mut BTreeSet<tf::Token>,
	) {
		let mut name_set: BTreeSet<tf::Token> = name_order.iter().cloned().collect();
		self.compose_child_names_recursive(0, name_order, &mut name_set, prohibited);

		if !prohibited.is_empty() {
			name_order.retain(|name| !prohibited.contains(name));
		}
	}

	fn compose_child_names_recursive(
		&self,
		node_index: u16,
		name_order: &mut Vec<tf::Token>,
		name_set: &mut BTreeSet<tf::Token>,
		prohibited: &mut BTreeSet<tf::Token>,
	) {
		let node = self.graph.node(node_index);
		if node.is_culled() {
			return;
		}

		// Reverse strength-order traversal (weak-to-strong).
		for child in self.graph.children(node_index).into_iter().rev() {
			self.compose_child_names_recursive(child, name_order, name_set, prohibited);
		}

		if !self.is_usd() {
			self.apply_relocates_to_child_names(node_index, name_order, name_set, prohibited);
		}

		let node = self.graph.node(node_index);
		if node.can_contribute_specs() {
			compose_site_child_names(&node.layer_stack, &node.site_path, name_order, name_set);
		}
	}

	// Apply relocations from just this node's layer stack, classified into
	// names to add, remove, or replace.
	fn apply_relocates_to_child_names(
		&self,
		node_index: u16,
		name_order: &mut Vec<tf::Token>,
		name_set: &mut BTreeSet<tf::Token>,
		prohibited: &mut BTreeSet<tf::Token>,
	) {
		let node = self.graph.node(node_index);
		let mut names_to_add = BTreeSet::new();
		let mut names_to_remove = BTreeSet::new();
		let mut names_to_replace: IndexMap<tf::Token, tf::Token> = IndexMap::new();

		// Use the incremental maps so nested relocations are examined one
		// step at a time.
		let source_to_target = node.layer_stack.incremental_relocates_source_to_target();
		for (old_path, new_path) in source_to_target.range(node.site_path.clone()..) {
			if !old_path.has_prefix(&node.site_path) {
				break;
			}
			if old_path.parent_path() == node.site_path {
				if new_path.parent_path() == node.site_path {
					// Target has the same parent, so this is a rename.
					names_to_replace.insert(old_path.name_token(), new_path.name_token());
				} else {
					names_to_remove.insert(old_path.name_token());
				}
				// The source name is now prohibited.
				prohibited.insert(old_path.name_token());
			}
		}

		let target_to_source = node.layer_stack.incremental_relocates_target_to_source();
		for (new_path, old_path) in target_to_source.range(node.site_path.clone()..) {
			if !new_path.has_prefix(&node.site_path) {
				break;
			}
			if new_path.parent_path() == node.site_path
				&& old_path.parent_path() != node.site_path
				&& !name_set.contains(&new_path.name_token())
			{
				names_to_add.insert(new_path.name_token());
			}
		}

		if !names_to_replace.is_empty() || !names_to_remove.is_empty() {
			let mut names_to_retain = Vec::with_capacity(name_order.len());
			for name in name_order.iter() {
				if let Some(new_name) = names_to_replace.get(name) {
					name_set.remove(name);
					// The new name may already be present from a weaker
					// node's child spec; the relocation shadows it.
					if name_set.insert(new_name.clone()) {
						names_to_retain.push(new_name.clone());
					}
				} else if !names_to_remove.contains(name) {
					names_to_retain.push(name.clone());
				} else {
					name_set.remove(name);
				}
			}
			*name_order = names_to_retain;
		}

		// Append children relocated to under this prim in lexicographic
		// order; there is no authored ordering statement among them.
		for name in names_to_add {
			name_set.insert(name.clone());
			name_order.push(name);
		}
	}

	/// Walk the graph weak-to-strong, composing prim property names.
	pub fn compute_prim_property_names(&self, name_order: &mut Vec<tf::Token>) {
		let mut name_set: BTreeSet<tf::Token> = name_order.iter().cloned().collect();
		for index in self.graph.node_range_strong_to_weak().into_iter().rev() {
			let node = self.graph.node(index);
			if node.is_culled() || !node.can_contribute_specs() {
				continue;
			}
			compose_site_property_names(&node.layer_stack, &node.site_path, name_order, &mut name_set);
		}
	}
}

/// Outputs of a prim index build.
#[derive(Default)]
pub struct PrimIndexOutputs {
	pub prim_index: PrimIndex,
	/// Every error encountered, in discovery order.
	pub all_errors: Vec<Error>,
	pub payload_state: PayloadState,
	pub dynamic_file_format_dependency: Vec<DynamicFileFormatDependency>,
	pub expression_variables_dependency: Vec<(Arc<LayerStack>, Vec<String>)>,
	pub culled_dependencies: Vec<CulledDependency>,
}

impl PrimIndexOutputs {
	/// Graft a recursively built child index under `parent` and fold the
	/// child's outputs into ours.
	pub fn append(
		&mut self,
		child: PrimIndexOutputs,
		parent: u16,
		arc: &NodeArc,
	) -> Result<u16, GraphError> {
		let new_node = self
			.prim_index
			.graph
			.insert_child_subgraph(parent, &child.prim_index.graph, arc)?;

		self.dynamic_file_format_dependency
			.extend(child.dynamic_file_format_dependency);
		self.add_expression_variable_dependencies(child.expression_variables_dependency);
		self.culled_dependencies.extend(child.culled_dependencies);
		self.all_errors.extend(child.all_errors);

		if child.payload_state != PayloadState::NoPayload {
			if self.payload_state == PayloadState::NoPayload {
				self.payload_state = child.payload_state;
			} else if self.payload_state != child.payload_state {
				tracing::warn!(
					parent_state = ?self.payload_state,
					child_state = ?child.payload_state,
					prim = %self.prim_index.path(),
					"inconsistent payload states; keeping the parent's"
				);
			}
		}

		Ok(new_node)
	}

	pub(crate) fn add_expression_variable_dependencies(
		&mut self,
		dependencies: Vec<(Arc<LayerStack>, Vec<String>)>,
	) {
		for (layer_stack, names) in dependencies {
			if let Some((_, existing)) = self
				.expression_variables_dependency
				.iter_mut()
				.find(|(ls, _)| Arc::ptr_eq(ls, &layer_stack))
			{
				for name in names {
					if !existing.contains(&name) {
						existing.push(name);
					}
				}
			} else {
				self.expression_variables_dependency.push((layer_stack, names));
			}
		}
	}
}

/// Record an error in both the prim index's local errors and the build's
/// error list. Capacity errors are reported at most once per build.
pub(crate) fn record_error(err: Error, prim_index: &mut PrimIndex, all_errors: &mut Vec<Error>) {
	if err.is_capacity_error() && all_errors.iter().any(|e| e.same_kind(&err)) {
		return;
	}
	all_errors.push(err.clone());
	prim_index.local_errors.push(err);
}

/// Compute the prim index for the given path in the given layer stack.
///
/// The path must be absolute and identify the pseudo-root, a prim, or a
/// prim variant selection.
pub fn compute_prim_index(
	prim_path: &sdf::Path,
	layer_stack: Arc<LayerStack>,
	inputs: &PrimIndexInputs,
) -> PrimIndexOutputs {
	let mut outputs = PrimIndexOutputs::default();

	if !(prim_path.is_absolute_root_or_prim_path() || prim_path.is_prim_variant_selection_path()) {
		debug_assert!(false, "<{prim_path}> must identify a prim or the pseudo-root");
		return outputs;
	}

	let site = Site::new(layer_stack, prim_path.clone());
	builder::build_prim_index(
		site.clone(),
		site,
		0,
		true,
		true,
		true,
		None,
		inputs,
		&mut outputs,
	);

	// Permission enforcement runs once as a post-pass; while the graph is
	// being built it is enough that each node's permission is kept
	// current.
	if !inputs.usd {
		enforce_permissions(&mut outputs.prim_index, &mut outputs.all_errors);
	}

	let instanceable = compute_is_instanceable(&outputs.prim_index);
	outputs.prim_index.graph.set_is_instanceable(instanceable);

	// We're done modifying the graph, so finalize it. The rescan must run
	// after finalization since it stores node indices.
	outputs.prim_index.graph.finalize();
	rescan_for_specs(&mut outputs.prim_index, inputs.usd, false);

	outputs
}

// Go backwards through the nodes in strength order, looking for prim
// specs. The first node that isn't public becomes the gate; every
// stronger node carrying specs violates permissions and is restricted.
pub(crate) fn enforce_permissions(prim_index: &mut PrimIndex, all_errors: &mut Vec<Error>) {
	let order = prim_index.graph.node_range_strong_to_weak();
	let root_site = prim_index.root_site();

	let mut private_site: Option<Site> = None;
	for &index in order.iter().rev() {
		let node = prim_index.graph.node(index);
		if !node.can_contribute_specs() {
			continue;
		}

		let node_has_specs = node.has_specs();
		let node_site = node.site();
		let node_permission = node.permission;

		if let Some(gate) = &private_site {
			prim_index.graph.node_mut(index).set_restricted(true);
			if node_has_specs {
				let err = Error::PrimPermissionDenied {
					root_site: root_site.clone(),
					site: node_site,
					private_site: gate.clone(),
				};
				record_error(err, prim_index, all_errors);
			}
		} else if node_permission != sdf::Permission::Public {
			private_site = Some(node_site);
		}
	}
}

/// Collect the prim stack and refresh per-node spec state. USD mode does
/// not retain prim stacks, only the `has_specs` flags.
pub(crate) fn rescan_for_specs(index: &mut PrimIndex, usd: bool, update_has_specs: bool) {
	let order = index.graph.node_range_strong_to_weak();

	if usd {
		if update_has_specs {
			for node_index in order {
				let node = index.graph.node(node_index);
				let has_specs = compose_site_has_prim_specs(&node.layer_stack, &node.site_path);
				index.graph.node_mut(node_index).set_has_specs(has_specs);
			}
		}
		return;
	}

	let mut prim_sites = Vec::new();
	for node_index in order {
		let node = index.graph.node(node_index);
		let mut node_has_specs = false;
		if !node.is_culled() && node.can_contribute_specs() {
			for (layer_index, layer) in node.layer_stack.layers().iter().enumerate() {
				if layer.has_spec(&node.site_path) && !node.site_path.is_absolute_root() {
					node_has_specs = true;
					prim_sites.push(CompressedSite {
						node_index,
						layer_index: layer_index as u16,
					});
				}
			}
		}
		if update_has_specs {
			index.graph.node_mut(node_index).set_has_specs(node_has_specs);
		}
	}
	index.prim_stack = prim_sites;
}

// A prim index is instanceable when instanceable metadata is composed on
// and it actually draws opinions across a direct composition arc; an
// instance with no arcs has nothing to share.
pub(crate) fn compute_is_instanceable(index: &PrimIndex) -> bool {
	let mut authored = None;
	for node_index in index.graph.node_range_strong_to_weak() {
		let node = index.graph.node(node_index);
		if !node.can_contribute_specs() {
			continue;
		}
		if authored.is_none() {
			authored = compose_site_instanceable(&node.layer_stack, &node.site_path);
		}
		if authored.is_some() {
			break;
		}
	}
	if authored != Some(true) {
		return false;
	}

	index
		.graph
		.node_range_strong_to_weak()
		.into_iter()
		.any(|node_index| {
			let node = index.graph.node(node_index);
			node.parent_index != INVALID_NODE_INDEX
				&& !node.is_due_to_ancestor()
				&& node.arc_type != ArcType::Root
		})
}
