//! The prim index builder: a priority-driven task scheduler that grows the
//! node graph one arc at a time until every composition arc has been
//! evaluated.
//!
//! Notes on the algorithm:
//!
//! - Inherits and implied inherits can be processed in any order relative
//!   to each other, as long as they finish before references, variants and
//!   payloads are decided: they may introduce information needed to
//!   evaluate those arcs, such as opinions with variant selections or
//!   overrides to a payload target path.
//!
//! - A payload is only processed when nothing else is left to do, so that
//!   every opinion that may affect the payload arc has been discovered,
//!   including those inside variants.
//!
//! - At each step, a new node may return the build to an earlier stage:
//!   a payload may introduce nodes that contain references, inherits, etc.
//!   Those are processed to completion before variants are re-examined.

use super::compose_site::{
	compose_site_arcs, compose_site_has_prim_specs, compose_site_has_symmetry,
	compose_site_inherits, compose_site_permission, compose_site_prim_sites,
	compose_site_specializes, compose_site_variant_selection, compose_site_variant_set_options,
	compose_site_variant_sets, RefOrPayload, SourceArcInfo,
};
use super::error::{CycleSegment, Error};
use super::graph::{GraphError, NodeArc, PrimIndexGraph, INVALID_NODE_INDEX};
use super::layer_stack::{LayerStack, Site};
use super::map_expr::{MapExpression, MapFunction};
use super::prim_index::{
	compute_is_instanceable, record_error, CulledDependency, DynamicFileFormatDependency,
	DynamicFormatContext, PayloadState, PrimIndexInputs, PrimIndexOutputs,
};
use super::task::{Task, TaskKind, TaskQueue};
use super::{is_class_based_arc, is_specialize_arc, ArcType};
use crate::sdf::{self, FIELD_KEYS};
use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};
use tracing::{debug, trace};

static NEW_DEFAULT_STANDIN_BEHAVIOR: LazyLock<bool> = LazyLock::new(|| {
	std::env::var("OPENCOMP_ENABLE_NEW_DEFAULT_STANDIN_BEHAVIOR")
		.map(|value| !matches!(value.as_str(), "0" | "false" | "FALSE"))
		.unwrap_or(true)
});

/// If enabled, the standin variant preference is the weakest opinion.
pub fn is_new_default_standin_behavior_enabled() -> bool {
	*NEW_DEFAULT_STANDIN_BEHAVIOR
}

/// Linkage across recursive builder invocations, so that a nested build
/// can query the graphs of builds still in progress: cycle detection,
/// duplicate suppression and variant resolution all see through parent
/// graphs via this chain.
pub(crate) struct StackFrame<'a> {
	pub requested_site: Site,
	pub parent_graph: &'a PrimIndexGraph,
	pub parent_node: u16,
	pub arc_to_parent: &'a NodeArc,
	pub previous: Option<&'a StackFrame<'a>>,
	pub skip_duplicate_nodes: bool,
}

/// Uniform parent traversal over a graph under construction and the
/// graphs of enclosing builds, with automatic path translation at frame
/// boundaries.
struct FrameIter<'a> {
	graph: &'a PrimIndexGraph,
	node: u16,
	frame: Option<&'a StackFrame<'a>>,
}

impl<'a> FrameIter<'a> {
	fn new(graph: &'a PrimIndexGraph, node: u16, frame: Option<&'a StackFrame<'a>>) -> Self {
		Self { graph, node, frame }
	}

	fn valid(&self) -> bool {
		self.node != INVALID_NODE_INDEX
	}

	fn site(&self) -> Site {
		self.graph.node(self.node).site()
	}

	/// The arc type connecting this node to its parent, looking through
	/// the frame boundary at a graph root.
	fn arc_type(&self) -> ArcType {
		let node = self.graph.node(self.node);
		if !node.is_root_node() {
			node.arc_type
		} else if let Some(frame) = self.frame {
			frame.arc_to_parent.arc_type
		} else {
			node.arc_type
		}
	}

	/// Step to the parent node, hopping across the frame boundary when at
	/// a graph root.
	fn next(&mut self) {
		let node = self.graph.node(self.node);
		if !node.is_root_node() {
			self.node = node.parent_index;
		} else {
			self.next_frame();
		}
	}

	/// Jump directly to the parent node in the enclosing frame.
	fn next_frame(&mut self) {
		if let Some(frame) = self.frame {
			self.node = frame.parent_node;
			self.graph = frame.parent_graph;
			self.frame = frame.previous;
		} else {
			self.node = INVALID_NODE_INDEX;
		}
	}
}

bitflags::bitflags! {
	/// Composition arc kinds found by a preflight scan of a node's specs.
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	struct ArcMask: u8 {
		const INHERITS    = 1 << 0;
		const VARIANTS    = 1 << 1;
		const REFERENCES  = 1 << 2;
		const PAYLOADS    = 1 << 3;
		const SPECIALIZES = 1 << 4;
	}
}

// Scan a node's specs for fields describing composition arcs. This is a
// preflight check confirming the presence of arcs before enqueuing the
// tasks that would evaluate them.
fn scan_arcs(layer_stack: &LayerStack, path: &sdf::Path) -> ArcMask {
	let mut arcs = ArcMask::empty();
	for layer in layer_stack.layers() {
		if !layer.has_spec(path) {
			continue;
		}
		if layer.has_field(path, &FIELD_KEYS.inherit_paths) {
			arcs |= ArcMask::INHERITS;
		}
		if layer.has_field(path, &FIELD_KEYS.variant_set_names) {
			arcs |= ArcMask::VARIANTS;
		}
		if layer.has_field(path, &FIELD_KEYS.references) {
			arcs |= ArcMask::REFERENCES;
		}
		if layer.has_field(path, &FIELD_KEYS.payload) {
			arcs |= ArcMask::PAYLOADS;
		}
		if layer.has_field(path, &FIELD_KEYS.specializes) {
			arcs |= ArcMask::SPECIALIZES;
		}
	}
	arcs
}

fn has_class_based_child(graph: &PrimIndexGraph, parent: u16) -> bool {
	graph
		.children(parent)
		.into_iter()
		.any(|child| is_class_based_arc(graph.node(child).arc_type))
}

fn has_specializes_child(graph: &PrimIndexGraph, parent: u16) -> bool {
	graph
		.children(parent)
		.into_iter()
		.any(|child| is_specialize_arc(graph.node(child).arc_type))
}

// The implied specializes algorithm wants to start at the most ancestral
// parent of the given node that is a specializes arc, if one exists.
fn find_starting_node_for_implied_specializes(graph: &PrimIndexGraph, node: u16) -> Option<u16> {
	let mut result = None;
	let mut current = node;
	while !graph.node(current).is_root_node() {
		if is_specialize_arc(graph.node(current).arc_type) {
			result = Some(current);
		}
		current = graph.node(current).parent_index;
	}
	result
}

// Walk up through contiguous class arcs from `node`, returning the
// deepest non-class ancestor (the instance) and the class-arc child of it
// on the walked chain.
fn find_starting_node_of_class_hierarchy(graph: &PrimIndexGraph, node: u16) -> (u16, u16) {
	debug_assert!(is_class_based_arc(graph.node(node).arc_type));
	let mut class_node = node;
	let mut instance = graph.node(node).parent_index;
	while is_class_based_arc(graph.node(instance).arc_type) {
		class_node = instance;
		instance = graph.node(instance).parent_index;
	}
	(instance, class_node)
}

// Given class-based node `node`, find the node where implied class
// processing must begin for `node` to be propagated correctly: the entire
// class chain it belongs to has to be propagated as a unit, even across
// ancestral class nesting. Propagating each class individually would act
// as if the instance inherited each of them directly, which is wrong when
// classes inherit classes.
fn find_starting_node_for_implied_classes(graph: &PrimIndexGraph, node: u16) -> u16 {
	let mut start = node;
	while is_class_based_arc(graph.node(start).arc_type) {
		let (instance, class_node) = find_starting_node_of_class_hierarchy(graph, start);
		start = instance;

		// If the instance inheriting the class hierarchy is itself
		// class-based there is an ancestral inherit to consider. When the
		// inherited class is a namespace child of the ancestral class we
		// are done; otherwise keep walking to the start of the ancestral
		// class hierarchy.
		if is_class_based_arc(graph.node(instance).arc_type) {
			let ancestral_class_path = graph.path_at_introduction(instance);
			let class_path = graph.node(class_node).site_path.clone();
			if class_path.has_prefix(&ancestral_class_path) {
				break;
			}
		}
	}
	start
}

// A map expression for an arc from `source_path` into `target` node,
// composing in relocations at the target when they apply.
fn create_map_expression_for_arc(
	source_path: &sdf::Path,
	target_layer_stack: &Arc<LayerStack>,
	target_path: &sdf::Path,
	inputs: &PrimIndexInputs,
	offset: sdf::Retiming,
) -> MapExpression {
	let target_path = target_path.strip_all_variant_selections();
	let arc_expr = MapExpression::constant(MapFunction::pair(
		source_path.clone(),
		target_path.clone(),
		offset,
	));

	if !inputs.usd {
		target_layer_stack
			.relocates_expression_for_path(&target_path)
			.compose(&arc_expr)
	} else {
		arc_expr
	}
}

fn is_implied_class_based_arc(arc_type: ArcType, parent: u16, origin: u16) -> bool {
	is_class_based_arc(arc_type) && parent != origin
}

fn node_is_implied_class_based_arc(graph: &PrimIndexGraph, node: u16) -> bool {
	let n = graph.node(node);
	is_implied_class_based_arc(n.arc_type, n.parent_index, n.origin_index)
}

// A cycle exists if, within one layer stack, a prim adds a child arc to
// its own namespace ancestor or descendant.
fn has_ancestor_cycle(parent_site: &Site, child_site: &Site) -> bool {
	Arc::ptr_eq(&parent_site.layer_stack, &child_site.layer_stack)
		&& (parent_site.path.has_prefix(&child_site.path)
			|| child_site.path.has_prefix(&parent_site.path))
}

/// The source details of an authored variant selection, used to apply the
/// standin fallback policy.
struct VselSource {
	arc_type: ArcType,
	site_path: sdf::Path,
	under_payload: bool,
	is_root_node: bool,
}

impl VselSource {
	fn from_node(graph: &PrimIndexGraph, node: u16) -> Self {
		let mut under_payload = false;
		let mut current = node;
		while current != INVALID_NODE_INDEX {
			if graph.node(current).arc_type == ArcType::Payload {
				under_payload = true;
				break;
			}
			current = graph.node(current).parent_index;
		}
		Self {
			arc_type: graph.node(node).arc_type,
			site_path: graph.node(node).site_path.clone(),
			under_payload,
			is_root_node: graph.node(node).is_root_node(),
		}
	}
}

/// Tracks which tasks remain to finish building the graph. As new nodes
/// are added, task entries are queued so the work happens in strength
/// priority order. This is the high-level control logic of the population
/// algorithm: at each step it decides what happens next.
pub(crate) struct PrimIndexer<'a, 'b> {
	// The root site for the prim indexing process.
	root_site: Site,
	// Total depth of ancestral recursion.
	ancestor_recursion_depth: usize,
	inputs: &'a PrimIndexInputs<'b>,
	outputs: &'a mut PrimIndexOutputs,
	// Links to enclosing recursive invocations, so recursive indexes can
	// query outer indexes for cycle detection and variant composition.
	previous_frame: Option<&'a StackFrame<'a>>,
	tasks: TaskQueue,
	evaluate_implied_specializes: bool,
	evaluate_variants: bool,
}

impl<'a, 'b> PrimIndexer<'a, 'b> {
	fn graph(&self) -> &PrimIndexGraph {
		&self.outputs.prim_index.graph
	}

	fn graph_mut(&mut self) -> &mut PrimIndexGraph {
		&mut self.outputs.prim_index.graph
	}

	fn graph_root_site(&self) -> Site {
		self.graph().node(0).site()
	}

	fn record_error(&mut self, err: Error) {
		let PrimIndexOutputs {
			prim_index,
			all_errors,
			..
		} = &mut *self.outputs;
		record_error(err, prim_index, all_errors);
	}

	fn add_task(&mut self, task: Task) {
		self.tasks.push(task, &self.outputs.prim_index.graph);
	}

	// Add this node and its children to the task queue. If a node does
	// not have specs or cannot contribute them, task kinds that would be
	// no-ops are not queued at all.
	fn add_tasks_for_node_recursively(
		&mut self,
		node: u16,
		skip_tasks_for_expressed_arcs: bool,
		skip_completed_nodes_for_implied_specializes: bool,
	) {
		for child in self.graph().children(node) {
			self.add_tasks_for_node_recursively(
				child,
				skip_tasks_for_expressed_arcs,
				skip_completed_nodes_for_implied_specializes,
			);
		}

		let usd = self.inputs.usd;
		let n = self.graph().node(node);
		let contributes_specs = n.has_specs() && n.can_contribute_specs();
		let is_relocate = n.arc_type == ArcType::Relocate;
		let arc_mask = if contributes_specs {
			scan_arcs(&n.layer_stack, &n.site_path)
		} else {
			ArcMask::empty()
		};

		if skip_completed_nodes_for_implied_specializes {
			// The node was already indexed; only tasks that come after
			// implied specializes still apply.
			if self.evaluate_variants && arc_mask.contains(ArcMask::VARIANTS) {
				self.add_task(Task::new(TaskKind::EvalNodeVariantSets, node));
			}
		} else {
			if self.evaluate_variants && arc_mask.contains(ArcMask::VARIANTS) {
				self.add_task(Task::new(TaskKind::EvalNodeVariantSets, node));
			}
			if !skip_tasks_for_expressed_arcs {
				// Skipped when adding nodes from an already composed
				// subtree: a recursively indexed ancestral subgraph, or a
				// specializes subtree propagated back to its origin.
				if arc_mask.contains(ArcMask::SPECIALIZES) {
					self.add_task(Task::new(TaskKind::EvalNodeSpecializes, node));
				}
				if arc_mask.contains(ArcMask::INHERITS) {
					self.add_task(Task::new(TaskKind::EvalNodeInherits, node));
				}
				if arc_mask.contains(ArcMask::PAYLOADS) {
					self.add_task(Task::new(TaskKind::EvalNodePayload, node));
				}
				if arc_mask.contains(ArcMask::REFERENCES) {
					self.add_task(Task::new(TaskKind::EvalNodeReferences, node));
				}
				if !usd {
					self.add_task(Task::new(TaskKind::EvalNodeRelocations, node));
				}
			}
			if !usd && is_relocate {
				self.add_task(Task::new(TaskKind::EvalImpliedRelocations, node));
			}
		}
	}

	fn add_tasks_for_root_node(&mut self, root: u16) {
		self.add_tasks_for_node_recursively(root, false, false);
	}

	fn add_tasks_for_node(
		&mut self,
		node: u16,
		skip_tasks_for_expressed_arcs: bool,
		skip_completed_nodes_for_implied_specializes: bool,
	) {
		// Any time an edge is added to the graph, implied class edges may
		// need updating.
		if !skip_completed_nodes_for_implied_specializes {
			if is_class_based_arc(self.graph().node(node).arc_type) {
				// The new node is itself class-based. Find the starting
				// prim of the chain of classes the node is part of and
				// propagate the entire chain as a single unit.
				let base = find_starting_node_for_implied_classes(self.graph(), node);
				self.add_task(Task::new(TaskKind::EvalImpliedClasses, base));
			} else if has_class_based_child(self.graph(), node) {
				// Class-based children represent inherits found during
				// the recursive computation of the node's subgraph; pick
				// them up and continue propagating them now that the
				// subgraph is merged into the parent graph.
				self.add_task(Task::new(TaskKind::EvalImpliedClasses, node));
			}
			if self.evaluate_implied_specializes {
				if let Some(base) =
					find_starting_node_for_implied_specializes(self.graph(), node)
				{
					// A new specializes node, or a node beneath one: the
					// subgraph beneath it must be propagated to the
					// appropriate location.
					self.add_task(Task::new(TaskKind::EvalImpliedSpecializes, base));
				} else if has_specializes_child(self.graph(), node) {
					self.add_task(Task::new(TaskKind::EvalImpliedSpecializes, node));
				}
			}
		}

		self.add_tasks_for_node_recursively(
			node,
			skip_tasks_for_expressed_arcs,
			skip_completed_nodes_for_implied_specializes,
		);
	}

	// Returns true if a prim spec is associated with the node or any of
	// its descendants.
	fn prim_spec_exists_under_node(&self, node: u16) -> bool {
		if self.graph().node(node).has_specs() {
			return true;
		}
		self.graph()
			.children(node)
			.into_iter()
			.any(|child| self.prim_spec_exists_under_node(child))
	}

	// Mark an entire subtree of nodes as inert.
	fn inert_subtree(&mut self, node: u16) {
		self.graph_mut().node_mut(node).set_inert(true);
		for child in self.graph().children(node) {
			self.inert_subtree(child);
		}
	}

	fn elide_subtree(&mut self, node: u16) {
		if self.inputs.cull {
			self.graph_mut().node_mut(node).set_culled(true);
		} else {
			self.graph_mut().node_mut(node).set_inert(true);
		}
		for child in self.graph().children(node) {
			self.elide_subtree(child);
		}
	}

	fn add_culled_dependencies(&mut self, node: u16) {
		if self.graph().node(node).is_culled() {
			let n = self.graph().node(node);
			self.outputs.culled_dependencies.push(CulledDependency {
				layer_stack: n.layer_stack.clone(),
				site_path: n.site_path.clone(),
			});
		}
		for child in self.graph().children(node) {
			self.add_culled_dependencies(child);
		}
	}

	// Check that no cycle is introduced by adding this arc.
	fn check_for_cycle(
		&self,
		parent: u16,
		origin: u16,
		arc_type: ArcType,
		child_site: &Site,
	) -> Option<Error> {
		// Don't check for cycles in placeholder implied class nodes under
		// relocates. Their arcs include the effect of relocations while
		// the relocates node holds the source path, which can yield
		// invalid sites. No opinions are added there anyway.
		if is_implied_class_based_arc(arc_type, parent, origin) {
			let mut it = FrameIter::new(self.graph(), parent, self.previous_frame);
			while it.valid() && is_implied_class_based_arc(it.arc_type(), parent, origin) {
				it.next();
			}
			if it.valid() && it.arc_type() == ArcType::Relocate {
				return None;
			}
		}

		// Variant arcs select a branch of scene description under the
		// same prim; the prefixed path is not a cycle.
		if arc_type == ArcType::Variant {
			return None;
		}

		let mut found_cycle = false;
		let mut child_site_in_frame = child_site.clone();
		let mut it = FrameIter::new(self.graph(), parent, self.previous_frame);
		while it.valid() {
			// Check for a cycle in this frame's graph.
			let mut node = it.node;
			while node != INVALID_NODE_INDEX {
				if has_ancestor_cycle(&it.graph.node(node).site(), &child_site_in_frame) {
					found_cycle = true;
					break;
				}
				node = it.graph.node(node).parent_index;
			}
			if found_cycle {
				break;
			}

			// Before crossing into the enclosing graph, rewrite the child
			// site's path into the path it will have once this subgraph
			// is added there. The requested path may be deeper than this
			// graph's root; a prefix replacement accounts for that.
			if let Some(frame) = it.frame {
				let requested = &frame.requested_site.path;
				let current_root = it.graph.root_path();
				child_site_in_frame.path = if *current_root == child_site_in_frame.path {
					requested.clone()
				} else {
					requested.replace_prefix(current_root, &child_site_in_frame.path)
				};
			}
			it.next_frame();
		}

		if !found_cycle {
			return None;
		}

		// Traverse the parent chain to collect the participating arcs,
		// then order them root to leaf.
		let mut cycle = Vec::new();
		let mut it = FrameIter::new(self.graph(), parent, self.previous_frame);
		while it.valid() {
			cycle.push(CycleSegment {
				site: it.site(),
				arc_type: it.arc_type(),
			});
			it.next();
		}
		cycle.reverse();
		let root_site = cycle
			.first()
			.map(|seg| seg.site.clone())
			.unwrap_or_else(|| child_site.clone());
		cycle.push(CycleSegment {
			site: child_site.clone(),
			arc_type,
		});

		Some(Error::ArcCycle { root_site, cycle })
	}

	fn graph_error_to_error(&self, err: GraphError) -> Error {
		let root_site = self.root_site.clone();
		match err {
			GraphError::IndexCapacityExceeded => Error::IndexCapacityExceeded { root_site },
			GraphError::ArcCapacityExceeded => Error::ArcCapacityExceeded { root_site },
			GraphError::ArcNamespaceDepthCapacityExceeded => {
				Error::ArcNamespaceDepthCapacityExceeded { root_site }
			}
		}
	}

	/// Add an arc of the given type from the parent node to the child
	/// site, and enqueue the tasks that result. Returns the new node.
	///
	/// If `include_ancestral_opinions` is set, recursively build and
	/// include the ancestral opinions that would affect the new site.
	#[allow(clippy::too_many_arguments)]
	fn add_arc(
		&mut self,
		arc_type: ArcType,
		parent: u16,
		origin: u16,
		site: Site,
		map_expr: MapExpression,
		sibling_num: usize,
		direct_contributes_specs: bool,
		include_ancestral_opinions: bool,
		skip_duplicate_nodes: bool,
	) -> Option<u16> {
		// Variant selections are path components but not levels of
		// namespace; they are excluded when measuring namespace depth.
		let namespace_depth = self
			.graph()
			.node(parent)
			.site_path
			.non_variant_element_count();
		self.add_arc_full(
			arc_type,
			parent,
			origin,
			site,
			map_expr,
			sibling_num,
			namespace_depth,
			direct_contributes_specs,
			include_ancestral_opinions,
			skip_duplicate_nodes,
			false,
			false,
		)
	}

	#[allow(clippy::too_many_arguments)]
	fn add_arc_full(
		&mut self,
		arc_type: ArcType,
		parent: u16,
		origin: u16,
		site: Site,
		map_expr: MapExpression,
		sibling_num: usize,
		namespace_depth: usize,
		mut direct_contributes_specs: bool,
		include_ancestral_opinions: bool,
		mut skip_duplicate_nodes: bool,
		skip_implied_specializes_completed_nodes: bool,
		skip_tasks_for_expressed_arcs: bool,
	) -> Option<u16> {
		debug!(
			arc = ?arc_type,
			site = %site,
			parent = %self.graph().node(parent).site(),
			ancestral = include_ancestral_opinions,
			"adding arc"
		);

		if let Some(err) = self.check_for_cycle(parent, origin, arc_type, &site) {
			self.record_error(err);
			return None;
		}

		// Decide whether adding this arc would give the final prim index
		// two nodes with the same site; such duplicate opinions must be
		// skipped. The current graph and the graphs of enclosing builds
		// all have to be searched.
		if let Some(frame) = self.previous_frame {
			skip_duplicate_nodes |= frame.skip_duplicate_nodes;
		}

		if skip_duplicate_nodes {
			let mut site_in_graph = site.clone();
			let mut it = FrameIter::new(self.graph(), parent, self.previous_frame);
			while it.valid() {
				if it.graph.node_using_site(&site_in_graph).is_some() {
					trace!(site = %site, "skipping duplicate node");
					return None;
				}

				// The enclosing graph may sit at a different level of
				// namespace; translate the site to the path it will have
				// once this graph is grafted there.
				if let Some(frame) = it.frame {
					let requested = &frame.requested_site.path;
					let current_root = it.graph.root_path();
					site_in_graph.path =
						requested.replace_prefix(current_root, &site_in_graph.path);
				}
				it.next_frame();
			}
		}

		// Local opinions are not allowed at or below the source of a
		// relocation (the salted earth policy). Only non-root prims can
		// be relocated, which is what includeAncestralOpinions indicates.
		if direct_contributes_specs
			&& include_ancestral_opinions
			&& site.layer_stack.path_is_at_or_under_relocates_source(&site.path)
		{
			direct_contributes_specs = false;
		}

		let arc = NodeArc {
			arc_type,
			map_to_parent: map_expr,
			origin_index: origin,
			namespace_depth,
			sibling_num_at_origin: sibling_num,
		};

		let new_node = if !include_ancestral_opinions {
			// No ancestral opinions. Just add the single new site.
			let inserted = self.graph_mut().insert_child(
				parent,
				site.path.clone(),
				site.layer_stack.clone(),
				&arc,
			);
			match inserted {
				Ok(new_node) => {
					let has_specs = compose_site_has_prim_specs(&site.layer_stack, &site.path);
					{
						let node = self.graph_mut().node_mut(new_node);
						node.set_inert(!direct_contributes_specs);
						node.set_has_specs(has_specs);
					}
					if !self.inputs.usd
						&& direct_contributes_specs
						&& has_specs
					{
						// Determine whether opinions from this site can
						// be accessed from other sites in the graph, and
						// whether it carries symmetry information.
						let permission = compose_site_permission(&site.layer_stack, &site.path);
						let has_symmetry =
							compose_site_has_symmetry(&site.layer_stack, &site.path);
						let node = self.graph_mut().node_mut(new_node);
						node.permission = permission;
						node.set_has_symmetry(has_symmetry);
					}
					new_node
				}
				Err(err) => {
					let err = self.graph_error_to_error(err);
					self.record_error(err);
					return None;
				}
			}
		} else {
			// Ancestral opinions are those above the source site in
			// namespace. Account for them by recursively building the
			// graph for the site itself and grafting its root node in as
			// the new child.
			//
			// Implied specializes must not be evaluated during the nested
			// build: any specializes arcs in the source index have to be
			// propagated to the root of the final graph for correct
			// strength ordering, which happens through tasks added after
			// the merge.
			//
			// Variants are also deferred: the nested build knows nothing
			// about opinions outside the source site, and a referencing
			// layer stack may hold a stronger opinion for a selection
			// than what is authored at the source.
			let mut child_outputs = PrimIndexOutputs::default();
			{
				let frame = StackFrame {
					requested_site: site.clone(),
					parent_graph: &self.outputs.prim_index.graph,
					parent_node: parent,
					arc_to_parent: &arc,
					previous: self.previous_frame,
					skip_duplicate_nodes,
				};
				build_prim_index(
					site.clone(),
					self.root_site.clone(),
					self.ancestor_recursion_depth,
					false,
					false,
					direct_contributes_specs,
					Some(&frame),
					self.inputs,
					&mut child_outputs,
				);
			}

			match self.outputs.append(child_outputs, parent, &arc) {
				Ok(new_node) => {
					// Record culled nodes from this subtree that
					// introduced ancestral dependencies; they may be
					// removed from the graph at finalization. Only the
					// top-level call records them, so multiple levels of
					// recursion do not rescan the same subtree.
					if self.previous_frame.is_none() {
						self.add_culled_dependencies(new_node);
					}
					new_node
				}
				Err(err) => {
					let err = self.graph_error_to_error(err);
					self.record_error(err);
					return None;
				}
			}
		};

		// If culling is enabled, check whether the subtree rooted at the
		// new node can be culled. Only the new node needs to be examined:
		// a nested build has already culled everything it could except
		// its own root.
		if self.inputs.cull {
			if node_can_be_culled(self.graph(), new_node, &self.root_site) {
				self.graph_mut().node_mut(new_node).set_culled(true);
			} else {
				// Ancestors marked culled must be updated: they now have
				// a subtree that isn't culled. This happens when implied
				// inherits from a class hierarchy land under a node whose
				// own site has no specs.
				let mut p = parent;
				while p != INVALID_NODE_INDEX && self.graph().node(p).is_culled() {
					self.graph_mut().node_mut(p).set_culled(false);
					p = self.graph().node(p).parent_index;
				}
			}
		}

		// A nested ancestral build has already evaluated refs, payloads
		// and inherits on the subgraph, so those tasks are skipped too.
		let skip_expressed = skip_tasks_for_expressed_arcs || include_ancestral_opinions;
		self.add_tasks_for_node(
			new_node,
			skip_expressed,
			skip_implied_specializes_completed_nodes,
		);

		// An arc directly targeting a private site is an error. The new
		// subtree is made inert so it contributes no specs, but the nodes
		// stay to track dependencies, supporting later changes that relax
		// the permissions. This is the direct-arc complement of the
		// ancestral constraint enforced after the build by the
		// permission post-pass.
		if self.graph().node(new_node).permission == sdf::Permission::Private {
			let err = Error::ArcPermissionDenied {
				root_site: self.graph_root_site(),
				site: self.graph().node(parent).site(),
				private_site: self.graph().node(new_node).site(),
				arc_type,
			};
			self.record_error(err);
			self.inert_subtree(new_node);
		}

		// A node at the pseudo-root is a dependency placeholder for an
		// unresolved default-target reference or payload: inert, but
		// retained to represent the dependency.
		if self.graph().node(new_node).site_path.is_absolute_root() {
			self.inert_subtree(new_node);
		}

		Some(new_node)
	}
}

////////////////////////////////////////////////////////////////////////
// References and payloads

impl PrimIndexer<'_, '_> {
	fn eval_node_references(&mut self, node: u16) {
		debug!(site = %self.graph().node(node).site(), "evaluating references");
		if !self.graph().node(node).can_contribute_specs() {
			return;
		}

		let n = self.graph().node(node);
		let layer_stack = n.layer_stack.clone();
		let path = n.site_path.clone();
		let (arcs, info, consulted) = compose_site_arcs::<sdf::Reference>(&layer_stack, &path);
		if !consulted.is_empty() {
			self.outputs
				.add_expression_variable_dependencies(vec![(layer_stack, consulted)]);
		}

		self.eval_ref_or_payload_arcs(node, arcs, info);
	}

	fn eval_node_payloads(&mut self, node: u16) {
		debug!(site = %self.graph().node(node).site(), "evaluating payloads");
		if !self.graph().node(node).can_contribute_specs() {
			return;
		}

		let n = self.graph().node(node);
		let layer_stack = n.layer_stack.clone();
		let path = n.site_path.clone();
		let (arcs, info, consulted) = compose_site_arcs::<sdf::Payload>(&layer_stack, &path);
		if !consulted.is_empty() {
			self.outputs
				.add_expression_variable_dependencies(vec![(layer_stack, consulted)]);
		}
		if arcs.is_empty() {
			return;
		}

		// Mark that this prim index contains a payload; whether it is
		// processed is decided separately below.
		self.graph_mut().set_has_payloads(true);

		// A payload composed as an ancestral arc of the target of a
		// subroot reference or payload is always included: the ancestral
		// prim index it belongs to is not one that stands on its own in a
		// cache, so there is no explicit way to include it. The enclosing
		// stack frame tells us whether this is such a build.
		let is_ancestral_payload_of_subroot_arc = self.previous_frame.is_some_and(|frame| {
			matches!(
				frame.arc_to_parent.arc_type,
				ArcType::Reference | ArcType::Payload
			) && self.graph_root_site() != frame.requested_site
		});

		if !is_ancestral_payload_of_subroot_arc {
			let Some(included_payloads) = self.inputs.included_payloads else {
				trace!("payload not included, skipping");
				return;
			};
			let path = &self.root_site.path;

			let compose_payload = if let Some(predicate) = self.inputs.include_payload_predicate {
				let included = predicate(path);
				self.outputs.payload_state = if included {
					PayloadState::IncludedByPredicate
				} else {
					PayloadState::ExcludedByPredicate
				};
				included
			} else {
				let included = included_payloads
					.read()
					.expect("included payload set lock")
					.contains(path);
				self.outputs.payload_state = if included {
					PayloadState::IncludedByIncludeSet
				} else {
					PayloadState::ExcludedByIncludeSet
				};
				included
			};

			if !compose_payload {
				trace!(path = %path, "payload not included, skipping");
				return;
			}
		}

		self.eval_ref_or_payload_arcs(node, arcs, info);
	}

	// Reference and payload arcs are composed in essentially the same way.
	fn eval_ref_or_payload_arcs<T: RefOrPayload>(
		&mut self,
		node: u16,
		arcs: Vec<T>,
		info: Vec<SourceArcInfo>,
	) {
		let arc_type = T::ARC_TYPE;
		for (arc_num, (ref_or_payload, info)) in arcs.iter().zip(info.iter()).enumerate() {
			let source_layer = info.layer.identifier().to_string();
			let mut layer_offset = ref_or_payload.layer_offset();

			trace!(
				asset = %info.authored_asset_path,
				prim_path = %ref_or_payload.prim_path(),
				arc = ?arc_type,
				"found arc"
			);

			let mut fail = false;

			// The target must be the default target (empty) or a prim
			// path without variant selections.
			let target = ref_or_payload.prim_path();
			if !target.is_empty()
				&& !(target.is_prim_path() && !target.contains_prim_variant_selection())
			{
				self.record_error(Error::InvalidPrimPath {
					root_site: self.graph_root_site(),
					site: self.graph().node(node).site(),
					prim_path: target.clone(),
					arc_type,
					source_layer: source_layer.clone(),
				});
				fail = true;
			}

			// Validate the layer offset authored on the arc.
			if !layer_offset.is_valid()
				|| layer_offset.scale == 0.0
				|| !layer_offset.inv().is_valid()
			{
				self.record_error(Error::InvalidReferenceOffset {
					root_site: self.graph_root_site(),
					source_layer: source_layer.clone(),
					source_path: self.graph().node(node).site_path.clone(),
					asset_path: info.authored_asset_path.clone(),
					target_path: target.clone(),
					offset: layer_offset,
					arc_type,
				});
				// Not fatal; just reset the offset.
				layer_offset = sdf::Retiming::default();
			} else {
				// Fold in the stack offset of the layer that introduced
				// the arc.
				layer_offset = info.layer_stack_offset * layer_offset;
			}

			if fail {
				continue;
			}

			// Compute the referenced layer stack.
			let node_layer_stack = self.graph().node(node).layer_stack.clone();
			let is_internal = ref_or_payload.asset_path().is_empty();
			let (layer, layer_stack) = if is_internal {
				(node_layer_stack.root_layer().clone(), node_layer_stack.clone())
			} else {
				let asset_path = ref_or_payload.asset_path();
				if let Some(muted) = self
					.inputs
					.cache
					.and_then(|cache| cache.muted_layer(asset_path))
				{
					self.record_error(Error::MutedAssetPath {
						root_site: self.graph_root_site(),
						site: self.graph().node(node).site(),
						target_path: target.clone(),
						asset_path: info.authored_asset_path.clone(),
						resolved_asset_path: muted,
						arc_type,
						source_layer: source_layer.clone(),
					});
					continue;
				}

				// Payloads may consult a dynamic file format for
				// arguments composed from prim fields; references do not
				// support this.
				if arc_type == ArcType::Payload {
					self.compose_dynamic_format_arguments(node, asset_path);
				}

				let Some(layer) = sdf::Layer::find_or_open(asset_path) else {
					self.record_error(Error::InvalidAssetPath {
						root_site: self.graph_root_site(),
						site: self.graph().node(node).site(),
						target_path: target.clone(),
						asset_path: info.authored_asset_path.clone(),
						resolved_asset_path: asset_path.to_string(),
						arc_type,
						source_layer: source_layer.clone(),
					});
					continue;
				};

				// The referencing stack's expression variables compose
				// over the referenced stack's own; adopting the override
				// source (rather than this stack's identifier) keeps
				// layer stacks shared when variables are sparsely
				// authored.
				let layer_stack = LayerStack::for_referenced_layer(
					layer.clone(),
					node_layer_stack.expression_variables(),
				);

				// A referenced layer running at a different
				// timecodes-per-second rate scales time across the arc.
				let source_tcps = info.layer.timecodes_per_second();
				let dest_tcps = layer_stack.timecodes_per_second();
				if source_tcps != dest_tcps {
					layer_offset.scale *= source_tcps / dest_tcps;
				}

				(layer, layer_stack)
			};

			let mut direct_contributes_specs = true;

			// The prim path is the one authored on the arc, or the
			// target layer's default prim.
			let prim_path = if target.is_empty() {
				let default_path = layer.default_prim_as_path();
				if default_path.is_empty() {
					self.record_error(Error::UnresolvedPrimPath {
						root_site: self.graph_root_site(),
						site: self.graph().node(node).site(),
						target_layer: layer.identifier().to_string(),
						unresolved_path: sdf::Path::absolute_root_path(),
						source_layer: source_layer.clone(),
						arc_type,
					});
					// Still add an arc to the pseudo-root as a dependency
					// placeholder, so authoring default-target metadata
					// in the target layer later invalidates this index.
					direct_contributes_specs = false;
					sdf::Path::absolute_root_path()
				} else {
					default_path
				}
			} else {
				target.clone()
			};

			// The mapping for the arc makes source and target map to
			// each other; paths outside do not map, except for internal
			// arcs which retain full namespace visibility.
			let node_path = self.graph().node(node).site_path.clone();
			let mut map_expr = create_map_expression_for_arc(
				&prim_path,
				&node_layer_stack,
				&node_path,
				self.inputs,
				layer_offset,
			);
			if is_internal {
				map_expr = map_expr.add_root_identity();
			}

			// Ancestral opinions only exist below root prims.
			let include_ancestral_opinions = !prim_path.is_root_prim_path();

			let new_node = self.add_arc(
				arc_type,
				node,
				node,
				Site::new(layer_stack, prim_path),
				map_expr,
				arc_num,
				direct_contributes_specs,
				include_ancestral_opinions,
				false,
			);

			// The arc must target a prim that exists in the referenced
			// layer stack. The node stays either way, for dependency
			// tracking.
			if let Some(new_node) = new_node
				&& !self.prim_spec_exists_under_node(new_node)
			{
				self.record_error(Error::UnresolvedPrimPath {
					root_site: self.graph_root_site(),
					site: self.graph().node(node).site(),
					target_layer: layer.identifier().to_string(),
					unresolved_path: self.graph().node(new_node).site_path.clone(),
					source_layer,
					arc_type,
				});
			}
		}
	}

	fn compose_dynamic_format_arguments(&mut self, node: u16, asset_path: &str) {
		let Some(format) = self
			.inputs
			.dynamic_file_formats
			.iter()
			.find(|format| {
				asset_path
					.rsplit_once('.')
					.is_some_and(|(_, ext)| ext == format.extension())
			})
		else {
			return;
		};

		let n = self.graph().node(node);
		let mut context = DynamicFormatContext {
			layer_stack: &n.layer_stack,
			path: &n.site_path,
			field_names: Vec::new(),
			attribute_names: Vec::new(),
		};
		let context_data = format.compose_arguments(asset_path, &mut context);
		let dependency = DynamicFileFormatDependency {
			file_format: format.format_name().to_string(),
			context_data,
			field_names: context.field_names,
			attribute_names: context.attribute_names,
		};
		self.outputs.dynamic_file_format_dependency.push(dependency);
	}
}

////////////////////////////////////////////////////////////////////////
// Relocations

impl PrimIndexer<'_, '_> {
	// For every relocation, a new node is introduced for the relocation
	// source and recursively populated via the arc adder; this is how the
	// effects of relocations are applied while walking down namespace.
	fn eval_node_relocations(&mut self, node: u16) {
		// Unlike other tasks this only skips non-contributing nodes that
		// were introduced at this level of namespace: a descendant node
		// without specs may be culled yet still be affected by relocates.
		if !self.graph().node(node).can_contribute_specs()
			&& self.graph().depth_below_introduction(node) == 0
		{
			return;
		}

		// Use the incremental relocates so that nested relocations
		// affecting the same prim from different levels of namespace are
		// all examined; the fully-combined map collapses them into one
		// entry and would skip intermediate sites.
		let n = self.graph().node(node);
		let Some(reloc_source) = n
			.layer_stack
			.incremental_relocates_target_to_source()
			.get(&n.site_path)
			.cloned()
		else {
			return;
		};
		let layer_stack = n.layer_stack.clone();

		debug!(
			target = %self.graph().node(node).site_path,
			source = %reloc_source,
			"node was relocated"
		);

		// The relocation source's opinions supersede ancestral arcs at
		// the relocation target, except variants, which may override
		// relocated prims. Ancestral relocation arcs are superseded by
		// this one, which sits closer to the prim being indexed.
		for child in self.graph().children(node) {
			match self.graph().node(child).arc_type {
				ArcType::Variant => continue,
				ArcType::Root => continue,
				ArcType::Relocate
				| ArcType::Reference
				| ArcType::Payload
				| ArcType::Inherit
				| ArcType::Specialize => {
					self.elide_subtree(child);
				}
			}
		}

		// The mapping for a relocation source node is identity: the
		// relocation mappings are applied across the arcs whose target
		// path is affected, so applying them again here would be
		// redundant. Relocation source nodes are placeholders that
		// incorporate the ancestral arcs of the source.
		//
		// A prim can only be relocated from a single place, so the arc
		// number is always zero. The direct site of a relocation source
		// may not contribute opinions, but its children usually do, via
		// ancestral arcs.
		let new_node = self.add_arc(
			ArcType::Relocate,
			node,
			node,
			Site::new(layer_stack, reloc_source),
			MapExpression::identity(),
			0,
			false,
			true,
			false,
		);

		if let Some(new_node) = new_node {
			// Issue errors for opinions found at the relocation source.
			// This fires only at the direct source, not for namespace
			// children beneath it; a known limitation kept for
			// compatibility.
			let n = self.graph().node(new_node);
			let sites = compose_site_prim_sites(&n.layer_stack, &n.site_path);
			let root_site = self.graph_root_site();
			for (layer, path) in sites {
				self.record_error(Error::OpinionAtRelocationSource {
					root_site: root_site.clone(),
					layer: layer.identifier().to_string(),
					path,
				});
			}

			// The added subtree may itself contain opinions that other
			// relocate statements move to a different prim; elide those
			// so the same site does not contribute to multiple prims.
			self.elide_relocated_subtrees(new_node);
		}
	}

	fn elide_relocated_subtrees(&mut self, node: u16) {
		for child in self.graph().children(node) {
			// A relocate node already did this work when it was added.
			if self.graph().node(child).arc_type == ArcType::Relocate {
				continue;
			}

			let child_node = self.graph().node(child);
			if child_node.can_contribute_specs()
				&& child_node
					.layer_stack
					.incremental_relocates_source_to_target()
					.contains_key(&child_node.site_path)
			{
				self.elide_subtree(child);
				continue;
			}

			self.elide_relocated_subtrees(child);
		}
	}

	fn eval_implied_relocations(&mut self, node: u16) {
		let n = self.graph().node(node);
		if n.arc_type != ArcType::Relocate || n.is_due_to_ancestor() {
			return;
		}

		let parent = n.parent_index;
		if parent == INVALID_NODE_INDEX {
			return;
		}
		let grandparent = self.graph().node(parent).parent_index;
		if grandparent == INVALID_NODE_INDEX {
			return;
		}

		// Determine the path of the relocation source prim in the
		// parent's layer stack. The mapping can fail: a sub-root
		// reference to a relocation target has no site for the source in
		// the referencing layer stack.
		let gp_reloc_source = self
			.graph()
			.node(parent)
			.map_to_parent
			.map_source_to_target(&self.graph().node(node).site_path);
		if gp_reloc_source.is_empty() {
			trace!("no implied site for relocation source, skipping");
			return;
		}

		// Skip if this was already propagated.
		for gp_child in self.graph().children(grandparent) {
			let child = self.graph().node(gp_child);
			if child.site_path == gp_reloc_source && child.arc_type == ArcType::Relocate {
				return;
			}
		}

		let gp_layer_stack = self.graph().node(grandparent).layer_stack.clone();
		self.add_arc(
			ArcType::Relocate,
			grandparent,
			node,
			Site::new(gp_layer_stack, gp_reloc_source),
			MapExpression::identity(),
			0,
			false,
			false,
			false,
		);
	}
}

////////////////////////////////////////////////////////////////////////
// Class-based arcs

impl PrimIndexer<'_, '_> {
	// Walk over the children of `parent`, looking for an existing
	// equivalent class arc. Under a relocates parent the sites of implied
	// class placeholders are not meaningful, so identity is compared via
	// the mapping and origin depth instead.
	fn find_matching_child(
		&self,
		parent: u16,
		parent_arc_type: ArcType,
		site: &Site,
		arc_type: ArcType,
		map_to_parent: &MapExpression,
		depth_below_introduction: usize,
	) -> Option<u16> {
		self.graph().children(parent).into_iter().find(|&child| {
			let child_node = self.graph().node(child);
			if parent_arc_type == ArcType::Relocate {
				child_node.arc_type == arc_type
					&& child_node.map_to_parent.evaluate() == map_to_parent.evaluate()
					&& self
						.graph()
						.depth_below_introduction(child_node.origin_index)
						== depth_below_introduction
			} else {
				child_node.site() == *site
			}
		})
	}

	// Use the mapping function to figure out the path to inherit, by
	// mapping the parent's site back to the source. The mapping accounts
	// for relocations along the way, which simply using the class path
	// would lose.
	//
	// Variant selections complicate this: they address storage, not
	// namespace, and must never appear in mapping functions. To add a
	// class arc at a variant site the selections are stripped before
	// mapping and re-added afterwards.
	fn determine_inherit_path(
		parent_path: &sdf::Path,
		inherit_map: &MapExpression,
	) -> sdf::Path {
		if !parent_path.contains_prim_variant_selection() {
			return inherit_map.map_target_to_source(parent_path);
		}

		let mut var_path = parent_path.clone();
		while !var_path.is_empty() && !var_path.is_prim_variant_selection_path() {
			var_path = var_path.parent_path();
		}
		inherit_map
			.map_target_to_source(&parent_path.strip_all_variant_selections())
			.replace_prefix(&var_path.strip_all_variant_selections(), &var_path)
	}

	// Add a single class-based arc below `parent`, returning the new node
	// or the existing equivalent one.
	fn add_class_based_arc(
		&mut self,
		arc_type: ArcType,
		parent: u16,
		origin: u16,
		inherit_map: MapExpression,
		inherit_arc_num: usize,
		ignore_if_same_as_site: Option<Site>,
	) -> Option<u16> {
		let parent_path = self.graph().node(parent).site_path.clone();
		let inherit_path = Self::determine_inherit_path(&parent_path, &inherit_map);

		// The parent node's arc type has to look through recursive
		// builds: what matters is the arc this node hangs from once the
		// index under construction is merged into its final graph.
		let parent_arc_type =
			FrameIter::new(self.graph(), parent, self.previous_frame).arc_type();

		if inherit_path.is_empty() {
			// The parent site is outside the co-domain of the inherit:
			// there is no site for the parent to inherit opinions from
			// along this arc. An inherit reaching outside a referenced
			// root cannot be mapped across the reference, and a variant
			// cannot contain opinions about root classes. Not an error,
			// just not meaningful from this site.
			trace!("no appropriate site for inheriting opinions");
			return None;
		}

		let inherit_site = Site::new(self.graph().node(parent).layer_stack.clone(), inherit_path.clone());

		// Multiple inherits can resolve to the same site, e.g. an implied
		// inherit that was also broken down explicitly. The first arc to
		// be populated wins; later equivalent arcs reuse its node.
		let origin_depth = self.graph().depth_below_introduction(origin);
		if let Some(child) = self.find_matching_child(
			parent,
			parent_arc_type,
			&inherit_site,
			arc_type,
			&inherit_map,
			origin_depth,
		) {
			trace!(site = %inherit_site, "class arc already exists, reusing");
			return Some(child);
		}

		// The class arc may map the parent's path unchanged. That happens
		// for an implied inherit propagated across a reference under a
		// relocation node: the relocations folded into the mapping make
		// the relocation source site hit the root identity and map to
		// itself. Such nodes must still be added so the class arc keeps
		// propagating up the graph, but they contribute no opinions.
		let should_contribute_specs = inherit_path != parent_path
			&& ignore_if_same_as_site
				.map(|ignore| ignore != inherit_site)
				.unwrap_or(true);

		// Placeholder duplicates must be added to keep propagation going;
		// genuine duplicates are skipped so two paths never reach the
		// same site.
		let skip_duplicate_nodes = should_contribute_specs;

		// Only subroot classes need ancestral opinions.
		let include_ancestral_opinions =
			should_contribute_specs && !inherit_path.is_root_prim_path();

		self.add_arc(
			arc_type,
			parent,
			origin,
			inherit_site,
			inherit_map,
			inherit_arc_num,
			should_contribute_specs,
			include_ancestral_opinions,
			skip_duplicate_nodes,
		)
	}

	fn add_class_based_arcs(&mut self, node: u16, class_arcs: Vec<sdf::Path>, arc_type: ArcType) {
		for (arc_num, arc_path) in class_arcs.into_iter().enumerate() {
			trace!(target = %arc_path, arc = ?arc_type, "found class arc");

			// Class arcs must target a prim path without variant
			// selections.
			if !(arc_path.is_prim_path() && !arc_path.contains_prim_variant_selection()) {
				self.record_error(Error::InvalidPrimPath {
					root_site: self.graph_root_site(),
					site: self.graph().node(node).site(),
					prim_path: arc_path,
					arc_type,
					source_layer: String::new(),
				});
				continue;
			}

			// The mapping for a class arc maps the class to the
			// instance; every other path maps to itself.
			let n = self.graph().node(node);
			let map_expr = create_map_expression_for_arc(
				&arc_path,
				&n.layer_stack.clone(),
				&n.site_path.clone(),
				self.inputs,
				sdf::Retiming::default(),
			)
			.add_root_identity();

			self.add_class_based_arc(arc_type, node, node, map_expr, arc_num, None);
		}
	}

	fn eval_node_inherits(&mut self, node: u16) {
		debug!(site = %self.graph().node(node).site(), "evaluating inherits");
		if !self.graph().node(node).can_contribute_specs() {
			return;
		}
		let n = self.graph().node(node);
		let arcs = compose_site_inherits(&n.layer_stack, &n.site_path);
		self.add_class_based_arcs(node, arcs, ArcType::Inherit);
	}

	fn eval_node_specializes(&mut self, node: u16) {
		debug!(site = %self.graph().node(node).site(), "evaluating specializes");
		if !self.graph().node(node).can_contribute_specs() {
			return;
		}
		let n = self.graph().node(node);
		let arcs = compose_site_specializes(&n.layer_stack, &n.site_path);
		self.add_class_based_arcs(node, arcs, ArcType::Specialize);
	}

	/// Build the effective map function for an implied class arc:
	/// `transfer` maps the parent of the arc to the destination parent,
	/// and conjugating the class mapping by it re-expresses the class in
	/// the destination namespace.
	fn get_implied_class(transfer: &MapExpression, class_arc: &MapExpression) -> MapExpression {
		if transfer.is_constant_identity() {
			return class_arc.clone();
		}
		transfer
			.compose(&class_arc.compose(&transfer.inverse()))
			.add_root_identity()
	}

	// Check `src` for class-based children and add corresponding implied
	// classes to `dest`.
	fn eval_implied_class_tree(
		&mut self,
		dest: u16,
		src: u16,
		transfer: &MapExpression,
		src_node_is_start_of_tree: bool,
	) {
		// Classes on relocates nodes exist only as placeholders to keep
		// propagation going; rather than propagating onto the relocates
		// node, compose its mapping into the transfer function and
		// propagate directly to its parent. Ancestral class hierarchies
		// beginning under the relocates node still need their own
		// evaluation, which the explicit task guarantees.
		if self.graph().node(dest).arc_type == ArcType::Relocate {
			let new_transfer = self
				.graph()
				.node(dest)
				.map_to_parent
				.add_root_identity()
				.compose(transfer);
			let dest_parent = self.graph().node(dest).parent_index;
			self.eval_implied_class_tree(dest_parent, src, &new_transfer, src_node_is_start_of_tree);
			self.add_task(Task::new(TaskKind::EvalImpliedClasses, dest));
			return;
		}

		// The child list must be collected up front: recursion adds nodes
		// to the arena.
		for src_child in self.graph().children(src) {
			if !is_class_based_arc(self.graph().node(src_child).arc_type) {
				continue;
			}

			// Distinguish true namespace-descendant classes of `src` from
			// the arc that continues a class chain: when dest inherits
			// src which inherits other, other must not be directly
			// implied onto dest.
			if src_node_is_start_of_tree
				&& is_class_based_arc(self.graph().node(src).arc_type)
				&& self.graph().depth_below_introduction(src)
					== self.graph().depth_below_introduction(src_child)
			{
				trace!("skipping ancestral class");
				continue;
			}

			let dest_class_func =
				Self::get_implied_class(transfer, &self.graph().node(src_child).map_to_parent);

			// If an implied class for src_child was already propagated to
			// dest, its origin gives it away and the work is done.
			let mut dest_child = self.graph().children(dest).into_iter().find(|&candidate| {
				let c = self.graph().node(candidate);
				c.origin_index == src_child
					&& c.map_to_parent.evaluate() == dest_class_func.evaluate()
			});

			// Try to add this implied class. This can fail when there is
			// no equivalent site to inherit, due to the namespace domains
			// of the mappings involved; or return an existing node when
			// dest already inherits the site. The origin and sibling
			// number of src_child carry over so the effective strength of
			// the implied class is preserved; distinct origins reconcile
			// classes arriving from multiple sources. A redundant arc
			// (same site as the source, e.g. a class outside a relocation
			// or variant scope) is still propagated but contributes no
			// opinions, which ignore_if_same_as_site arranges.
			if dest_child.is_none() {
				let sibling_num =
					self.graph().node(src_child).sibling_num_at_origin as usize;
				let ignore_site = self.graph().node(src_child).site();
				dest_child = self.add_class_based_arc(
					self.graph().node(src_child).arc_type,
					dest,
					src_child,
					dest_class_func.clone(),
					sibling_num,
					Some(ignore_site),
				);
			}

			// Recurse on nested classes to build up the full inherited
			// class hierarchy.
			if let Some(dest_child) = dest_child
				&& has_class_based_child(self.graph(), src_child)
			{
				// The child transfer function walks up from src_child,
				// across the transfer, and down into dest_child.
				let child_transfer = dest_class_func
					.inverse()
					.compose(&transfer.compose(&self.graph().node(src_child).map_to_parent));
				self.eval_implied_class_tree(dest_child, src_child, &child_transfer, false);
			}
		}
	}

	fn eval_implied_classes(&mut self, node: u16) {
		debug!(site = %self.graph().node(node).site(), "evaluating implied classes");

		// The root has nowhere to propagate classes to.
		if self.graph().node(node).is_root_node() {
			return;
		}

		// Inherits must not propagate from beneath propagated specializes
		// arcs; they propagate from the origins of those arcs instead, so
		// the origin nodes of the implied inherits get a consistent
		// strength ordering. The implied specializes task handles that.
		if self.is_propagated_specializes_node(node) {
			return;
		}

		if !has_class_based_child(self.graph(), node) {
			return;
		}

		// The mapping to the parent may have a restricted domain, as for
		// a reference arc that only maps the referenced root prim. Root
		// classes deliberately map across such arcs, which the added
		// root identity provides; this is not a violation of reference
		// namespace encapsulation.
		let transfer = self.graph().node(node).map_to_parent.add_root_identity();
		let parent = self.graph().node(node).parent_index;
		self.eval_implied_class_tree(parent, node, &transfer, true);
	}
}

////////////////////////////////////////////////////////////////////////
// Implied specializes
//
// Opinions from specializes arcs, including those implied across other
// arcs, are always weaker than the target of those arcs: opinions from
// all specializes arcs (and any encapsulated arcs) come after all other
// opinions. To get that ordering, specializes subgraphs are propagated to
// the root of the graph, where strength ordering places them last.
//
// The process reverses when additional arcs are discovered beneath the
// propagated subgraphs: namespace children beneath the source of a
// specializes arc with arcs of their own, or variants discovered after
// implied specializes ran. The subgraph is propagated back to its origin
// so implied-arc propagation can run through the usual mechanisms, then
// propagated up to the root again.

impl PrimIndexer<'_, '_> {
	// A specializes node that was propagated to the root for strength
	// ordering: its parent is the root and it shares its origin's site.
	fn is_propagated_specializes_node(&self, node: u16) -> bool {
		let n = self.graph().node(node);
		is_specialize_arc(n.arc_type)
			&& n.parent_index == self.graph().root_node_index()
			&& n.origin_index != INVALID_NODE_INDEX
			&& self.graph().node(n.origin_index).site() == n.site()
	}

	fn is_node_in_subtree(&self, node: u16, subtree_root: u16) -> bool {
		let mut current = node;
		while current != INVALID_NODE_INDEX {
			if current == subtree_root {
				return true;
			}
			current = self.graph().node(current).parent_index;
		}
		false
	}

	fn propagate_node_to_parent(
		&mut self,
		parent_node: u16,
		src_node: u16,
		skip_implied_specializes: bool,
		skip_tasks_for_expressed_arcs: bool,
		map_to_parent: &MapExpression,
		src_tree_root: u16,
	) -> Option<u16> {
		if self.graph().node(src_node).parent_index == parent_node {
			return Some(src_node);
		}

		let src = self.graph().node(src_node);
		let src_site = src.site();
		let src_arc_type = src.arc_type;
		let parent_arc_type = self.graph().node(parent_node).arc_type;
		let src_depth = self.graph().depth_below_introduction(src_node);

		let mut new_node = self.find_matching_child(
			parent_node,
			parent_arc_type,
			&src_site,
			src_arc_type,
			map_to_parent,
			src_depth,
		);

		if new_node.is_none() {
			// Only propagate a non-implied arc, or an implied arc whose
			// origin lies outside the subgraph being propagated. An
			// implied arc originating within the subgraph is recreated
			// when implied classes are evaluated on the propagated
			// subgraph.
			if !node_is_implied_class_based_arc(self.graph(), src_node)
				|| !self.is_node_in_subtree(self.graph().node(src_node).origin_index, src_tree_root)
			{
				let namespace_depth = if src_node == src_tree_root {
					self.graph()
						.node(parent_node)
						.site_path
						.non_variant_element_count()
				} else {
					self.graph().node(src_node).namespace_depth as usize
				};

				let origin_node = if src_node == src_tree_root
					|| node_is_implied_class_based_arc(self.graph(), src_node)
				{
					src_node
				} else {
					parent_node
				};

				let direct_contributes = !self.graph().node(src_node).is_inert();
				let sibling_num = self.graph().node(src_node).sibling_num_at_origin as usize;
				new_node = self.add_arc_full(
					src_arc_type,
					parent_node,
					origin_node,
					src_site,
					map_to_parent.clone(),
					sibling_num,
					namespace_depth,
					direct_contributes,
					false,
					false,
					skip_implied_specializes,
					skip_tasks_for_expressed_arcs,
				);
			}
		}

		match new_node {
			Some(new_node) => {
				let (inert, has_symmetry, permission, restricted) = {
					let src = self.graph().node(src_node);
					(
						src.is_inert(),
						src.has_symmetry(),
						src.permission,
						src.is_restricted(),
					)
				};
				{
					let node = self.graph_mut().node_mut(new_node);
					node.set_inert(inert);
					node.set_has_symmetry(has_symmetry);
					node.permission = permission;
					node.set_restricted(restricted);
				}
				self.graph_mut().node_mut(src_node).set_inert(true);
				Some(new_node)
			}
			None => {
				self.inert_subtree(src_node);
				None
			}
		}
	}

	fn propagate_specializes_tree_to_root(
		&mut self,
		parent_node: u16,
		src_node: u16,
		map_to_parent: &MapExpression,
		src_tree_root: u16,
	) {
		// Skip implied specializes tasks for the propagated node, or it
		// would be propagated right back to its originating subtree and
		// left inert there. Expressed arc tasks are still queued for the
		// nodes propagated to the root.
		let Some(new_node) = self.propagate_node_to_parent(
			parent_node,
			src_node,
			true,
			false,
			map_to_parent,
			src_tree_root,
		) else {
			return;
		};

		for child in self.graph().children(src_node) {
			if !is_specialize_arc(self.graph().node(child).arc_type) {
				let child_map = self.graph().node(child).map_to_parent.clone();
				self.propagate_specializes_tree_to_root(new_node, child, &child_map, src_tree_root);
			}
		}
	}

	fn find_specializes_to_propagate_to_root(&mut self, node: u16) {
		// A placeholder implied arc under a relocation node only exists
		// so class-based arcs keep propagating; it is not a valid source
		// of opinions and the search stops there.
		let n = self.graph().node(node);
		let parent = n.parent_index;
		if parent != INVALID_NODE_INDEX {
			let node_is_relocates_placeholder = parent != n.origin_index
				&& self.graph().node(parent).arc_type == ArcType::Relocate
				&& self.graph().node(parent).site() == n.site();
			if node_is_relocates_placeholder {
				return;
			}
		}

		if is_specialize_arc(self.graph().node(node).arc_type) {
			debug!(
				site = %self.graph().node(node).site(),
				"propagating specializes arc to root"
			);

			// When arcs are propagated back to their origin they are
			// marked inert=false, but implied specializes originating
			// from them are not. Forcing inert=false here keeps a
			// subsequent propagation to the root from copying a stale
			// inert flag from such an implied arc.
			self.graph_mut().node_mut(node).set_inert(false);

			let map_to_root = self.graph().map_to_root(node);
			let root = self.graph().root_node_index();
			self.propagate_specializes_tree_to_root(root, node, &map_to_root, node);
		}

		for child in self.graph().children(node) {
			self.find_specializes_to_propagate_to_root(child);
		}
	}

	fn propagate_arcs_to_origin(
		&mut self,
		parent_node: u16,
		src_node: u16,
		map_to_parent: &MapExpression,
		src_tree_root: u16,
	) {
		// Implied specializes tasks stay enabled while propagating back
		// to the origin: if one of the propagated arcs is another
		// specializes arc, it must later be propagated to the root.
		// Expressed arc tasks are skipped so the whole subtree (direct
		// and ancestral arcs alike) can be copied without enqueuing
		// duplicate work for the propagated nodes.
		let Some(new_node) = self.propagate_node_to_parent(
			parent_node,
			src_node,
			false,
			true,
			map_to_parent,
			src_tree_root,
		) else {
			return;
		};

		for child in self.graph().children(src_node) {
			let child_map = self.graph().node(child).map_to_parent.clone();
			self.propagate_arcs_to_origin(new_node, child, &child_map, src_tree_root);
		}
	}

	fn find_arcs_to_propagate_to_origin(&mut self, node: u16) {
		debug_assert!(is_specialize_arc(self.graph().node(node).arc_type));
		let origin = self.graph().node(node).origin_index;
		for child in self.graph().children(node) {
			let child_map = self.graph().node(child).map_to_parent.clone();
			self.propagate_arcs_to_origin(origin, child, &child_map, node);
		}
	}

	fn eval_implied_specializes(&mut self, node: u16) {
		debug!(site = %self.graph().node(node).site(), "evaluating implied specializes");

		if self.graph().node(node).is_root_node() {
			return;
		}

		if self.is_propagated_specializes_node(node) {
			self.find_arcs_to_propagate_to_origin(node);
		} else {
			self.find_specializes_to_propagate_to_root(node);
		}
	}
}

////////////////////////////////////////////////////////////////////////
// Variants

type ConsultedVariables = Vec<(Arc<LayerStack>, Vec<String>)>;

// If this node has an authored selection, use it; an authored empty
// string explicitly selects no variant.
fn compose_variant_selection_for_node(
	graph: &PrimIndexGraph,
	node: u16,
	path_in_node: &sdf::Path,
	vset: &str,
	consulted: &mut ConsultedVariables,
) -> Option<(String, VselSource)> {
	debug_assert!(!path_in_node.contains_prim_variant_selection());

	let n = graph.node(node);
	if !n.can_contribute_specs() {
		return None;
	}

	// path_in_node is a namespace path, not a storage path; to find the
	// storage site any variant selection on this node has to be put back.
	let site_path = if n.arc_type == ArcType::Variant {
		path_in_node.replace_prefix(
			&n.site_path.strip_all_variant_selections(),
			&n.site_path,
		)
	} else {
		path_in_node.clone()
	};

	let mut names = Vec::new();
	let selection = compose_site_variant_selection(&n.layer_stack, &site_path, vset, &mut names);
	if !names.is_empty() {
		consulted.push((n.layer_stack.clone(), names));
	}

	selection.map(|vsel| (vsel, VselSource::from_node(graph, node)))
}

// Check the tree rooted at `node` for a node representing a prior
// selection of the given variant set for the path.
fn find_prior_variant_selection(
	graph: &PrimIndexGraph,
	node: u16,
	path_in_root: &sdf::Path,
	ancestor_recursion_depth: usize,
	vset: &str,
) -> Option<(String, VselSource)> {
	let n = graph.node(node);
	// Only variant nodes at the same effective depth of namespace
	// represent a prior decision for this prim.
	if n.arc_type == ArcType::Variant
		&& graph.depth_below_introduction(node) == ancestor_recursion_depth
	{
		let path_at_introduction = graph.path_at_introduction(node);
		if let Some((node_vset, node_vsel)) = path_at_introduction.variant_selection()
			&& node_vset.as_str() == vset
		{
			// The node selects from the right variant set, but it must
			// also represent the queried prim path rather than another
			// prim whose set shares the name. The query path was mapped
			// up to the root, so map it back down for comparison.
			let path_in_node = graph.map_to_root(node).map_target_to_source(path_in_root);
			// A path that does not translate to this node cannot
			// translate to any of its children either.
			if path_in_node.is_empty() {
				return None;
			}
			if path_at_introduction.prim_path() == path_in_node {
				return Some((node_vsel.to_string(), VselSource::from_node(graph, node)));
			}
		}
	}

	for child in graph.children(node) {
		if let Some(found) =
			find_prior_variant_selection(graph, child, path_in_root, ancestor_recursion_depth, vset)
		{
			return Some(found);
		}
	}
	None
}

// Compose the variant selection in strong-to-weak order across the graph
// under construction, hopping into the graphs of enclosing builds at the
// recorded stack-frame boundaries.
fn compose_variant_selection_across_stack_frames<'g>(
	graph: &'g PrimIndexGraph,
	node: u16,
	path_in_node: &sdf::Path,
	vset: &str,
	stack_frames: &mut Vec<(&'g StackFrame<'g>, &'g PrimIndexGraph, u16)>,
	consulted: &mut ConsultedVariables,
) -> Option<(String, VselSource)> {
	if let Some(found) =
		compose_variant_selection_for_node(graph, node, path_in_node, vset, consulted)
	{
		return Some(found);
	}

	// At the end of the graph produced by the current stack frame, the
	// traversal continues into the graph recorded for the next frame.
	let at_end_of_stack = stack_frames.last().is_some_and(|(frame, _, _)| {
		node == frame.parent_node && std::ptr::eq(graph, frame.parent_graph)
	});
	if at_end_of_stack {
		let (frame, child_graph, child_node) = stack_frames.pop().expect("frame stack is non-empty");
		let path_in_child = frame
			.arc_to_parent
			.map_to_parent
			.map_target_to_source(path_in_node);
		if path_in_child.is_empty() {
			return None;
		}
		return compose_variant_selection_across_stack_frames(
			child_graph,
			child_node,
			&path_in_child,
			vset,
			stack_frames,
			consulted,
		);
	}

	for child in graph.children(node) {
		let path_in_child = graph
			.node(child)
			.map_to_parent
			.map_target_to_source(path_in_node);
		if path_in_child.is_empty() {
			continue;
		}
		if let Some(found) = compose_variant_selection_across_stack_frames(
			graph,
			child,
			&path_in_child,
			vset,
			stack_frames,
			consulted,
		) {
			return Some(found);
		}
	}

	None
}

// Convert a (node, path) pair to the graph's root node, mapping the path
// up the parent chain. Returns false if the path does not translate all
// the way to the root.
fn convert_to_root_node_and_path(
	graph: &PrimIndexGraph,
	node: &mut u16,
	path: &mut sdf::Path,
) -> bool {
	if graph.node(*node).is_root_node() {
		return true;
	}
	*path = graph.map_to_root(*node).map_source_to_target(path);
	*node = graph.root_node_index();
	!path.is_empty()
}

impl PrimIndexer<'_, '_> {
	// Find the strongest authored opinion for a variant selection. The
	// selection may come from weaker locations than the node being
	// evaluated, so this is a strength-order traversal of the entire
	// index under construction, made interesting by recursive builds:
	// stack frames let the traversal see the subgraphs being built up as
	// if they were already joined.
	fn compose_variant_selection(
		&mut self,
		node: u16,
		path_in_node: &sdf::Path,
		vset: &str,
	) -> Option<(String, VselSource)> {
		debug_assert!(!path_in_node.contains_prim_variant_selection());

		let mut consulted: ConsultedVariables = Vec::new();
		let result = (|| {
			let graph = &self.outputs.prim_index.graph;

			// Translate the path up to the root of the entire index under
			// construction, tracking the frame boundaries crossed.
			let mut root_node = node;
			let mut path_in_root = path_in_node.clone();
			convert_to_root_node_and_path(graph, &mut root_node, &mut path_in_root);

			// First check for a selection this variant set has already
			// resolved to, in the current frame or any enclosing one.
			if let Some(found) = find_prior_variant_selection(
				graph,
				root_node,
				&path_in_root,
				self.ancestor_recursion_depth,
				vset,
			) {
				return Some(found);
			}

			let mut stack_frames: Vec<(&StackFrame, &PrimIndexGraph, u16)> = Vec::new();
			let mut current_graph = graph;
			let mut frame_iter = self.previous_frame;
			while let Some(frame) = frame_iter {
				// The path may fail to map across this frame, e.g. for
				// ancestral selections on a sub-root reference. No sites
				// beyond the frame can then hold relevant opinions, and
				// only the portion of the index already traversed is
				// searched. The mapping may also stop partway up the
				// previous frame's graph, for the same reason.
				let path_in_previous = frame
					.arc_to_parent
					.map_to_parent
					.map_source_to_target(&path_in_root);
				if path_in_previous.is_empty() {
					break;
				}
				let mut previous_root = frame.parent_node;
				let mut previous_path = path_in_previous;
				if !convert_to_root_node_and_path(
					frame.parent_graph,
					&mut previous_root,
					&mut previous_path,
				) {
					break;
				}

				if let Some(found) = find_prior_variant_selection(
					frame.parent_graph,
					previous_root,
					&previous_path,
					self.ancestor_recursion_depth,
					vset,
				) {
					return Some(found);
				}

				stack_frames.push((frame, current_graph, current_graph.root_node_index()));
				current_graph = frame.parent_graph;
				path_in_root = previous_path;
				frame_iter = frame.previous;
			}

			// Now walk the combined prim index in strong-to-weak order
			// looking for an authored selection.
			compose_variant_selection_across_stack_frames(
				current_graph,
				current_graph.root_node_index(),
				&path_in_root,
				vset,
				&mut stack_frames,
				&mut consulted,
			)
		})();

		self.outputs.add_expression_variable_dependencies(consulted);
		result
	}

	// Whether the fallback beats the authored selection. The standin
	// variant set keeps legacy behavior with several carve-outs; every
	// other set simply defaults when nothing is selected.
	fn should_use_variant_fallback(
		&self,
		vset: &str,
		authored: Option<&(String, VselSource)>,
		fallback: &str,
	) -> bool {
		if fallback.is_empty() {
			return false;
		}

		let Some((vsel, source)) = authored else {
			return true;
		};
		if vsel.is_empty() {
			return true;
		}

		if vset != "standin" {
			return false;
		}

		// Under the new behavior the preference never beats an authored
		// opinion.
		if is_new_default_standin_behavior_enabled() {
			return false;
		}

		// A variant node that already selects for this set structurally
		// represents a decision already made; applying the preference
		// again could contradict it.
		if source.arc_type == ArcType::Variant
			&& source.site_path.is_prim_variant_selection_path()
			&& source
				.site_path
				.variant_selection()
				.is_some_and(|(set, _)| set.as_str() == vset)
		{
			return false;
		}

		// Use the standin preference if the authored selection came from
		// inside the payload.
		if source.under_payload {
			return true;
		}

		// Keep the authored selection if it came from a session layer.
		let root_layer_stack = &self.root_site.layer_stack;
		for layer in root_layer_stack.layers() {
			if Arc::ptr_eq(layer, root_layer_stack.root_layer()) {
				break;
			}
			if let Some(spec) = layer.prim_spec(&self.root_site.path)
				&& let Some(selections) = &spec.variant_selection
				&& selections.get(vset) == Some(vsel)
			{
				return false;
			}
		}

		// Without a standin selection in the root node, defer to the
		// preference.
		source.arc_type != ArcType::Root
	}

	fn choose_best_fallback_among_options(
		&self,
		vset: &str,
		options: &BTreeSet<String>,
	) -> String {
		if let Some(fallbacks) = self.inputs.variant_fallbacks.get(vset) {
			for fallback in fallbacks {
				if options.contains(fallback) {
					return fallback.clone();
				}
			}
		}
		String::new()
	}

	fn add_variant_arc(&mut self, node: u16, vset: &str, vset_num: usize, vsel: &str) {
		// Variants do not remap namespace; they branch into a different
		// section of layer storage. The source site carries the variant
		// selection while the mapping is identity.
		let n = self.graph().node(node);
		let variant_path = n.site_path.append_variant_selection(vset, vsel);
		let site = Site::new(n.layer_stack.clone(), variant_path);

		if self
			.add_arc(
				ArcType::Variant,
				node,
				node,
				site,
				MapExpression::identity(),
				vset_num,
				true,
				false,
				false,
			)
			.is_some()
		{
			// Expanding a variant set may expose authored selections
			// that pending variant tasks defaulted on; retry them as
			// authored tasks.
			self.tasks
				.retry_variant_tasks(&self.outputs.prim_index.graph);
		}
	}

	fn eval_node_variant_sets(&mut self, node: u16) {
		debug!(site = %self.graph().node(node).site(), "evaluating variant sets");
		if !self.graph().node(node).can_contribute_specs() {
			return;
		}

		let n = self.graph().node(node);
		let vset_names = compose_site_variant_sets(&n.layer_stack, &n.site_path);
		for (vset_num, vset_name) in vset_names.into_iter().enumerate() {
			self.add_task(Task::variant(
				TaskKind::EvalNodeVariantAuthored,
				node,
				vset_name,
				vset_num,
			));
		}
	}

	fn eval_node_authored_variant(&mut self, node: u16, vset: &str, vset_num: usize) {
		debug!(
			site = %self.graph().node(node).site(),
			vset,
			"evaluating authored variant selection"
		);
		if !self.graph().node(node).can_contribute_specs() {
			return;
		}

		let n = self.graph().node(node);
		let options = compose_site_variant_set_options(&n.layer_stack, &n.site_path, vset);
		let path_in_node = n.site_path.strip_all_variant_selections();

		// Determine what the fallback selection would be. Authored
		// opinions generally win over fallbacks, but the legacy standin
		// behavior makes that conditional, so the fallback is computed
		// first.
		let fallback = self.choose_best_fallback_among_options(vset, &options);

		let authored = self.compose_variant_selection(node, &path_in_node, vset);
		if let Some((vsel, _)) = &authored {
			trace!(vset, vsel, "found authored variant selection");
		}

		if self.should_use_variant_fallback(vset, authored.as_ref(), &fallback) {
			self.add_task(Task::variant(
				TaskKind::EvalNodeVariantFallback,
				node,
				vset.to_string(),
				vset_num,
			));
			return;
		}

		let Some((vsel, _)) = authored else {
			self.add_task(Task::variant(
				TaskKind::EvalNodeVariantNoneFound,
				node,
				vset.to_string(),
				vset_num,
			));
			return;
		};
		if vsel.is_empty() {
			// No variant chosen; do not expand this variant set.
			self.add_task(Task::variant(
				TaskKind::EvalNodeVariantNoneFound,
				node,
				vset.to_string(),
				vset_num,
			));
			return;
		}

		self.add_variant_arc(node, vset, vset_num, &vsel);
	}

	fn eval_node_fallback_variant(&mut self, node: u16, vset: &str, vset_num: usize) {
		debug!(
			site = %self.graph().node(node).site(),
			vset,
			"evaluating fallback variant selection"
		);
		if !self.graph().node(node).can_contribute_specs() {
			return;
		}

		let n = self.graph().node(node);
		let options = compose_site_variant_set_options(&n.layer_stack, &n.site_path, vset);
		let vsel = self.choose_best_fallback_among_options(vset, &options);
		if vsel.is_empty() {
			self.add_task(Task::variant(
				TaskKind::EvalNodeVariantNoneFound,
				node,
				vset.to_string(),
				vset_num,
			));
			return;
		}

		self.add_variant_arc(node, vset, vset_num, &vsel);
	}
}

////////////////////////////////////////////////////////////////////////
// Culling

// Returns true if the node can be culled: in general, when no node in its
// subtree contributes opinions, with documented exceptions.
fn node_can_be_culled(graph: &PrimIndexGraph, node: u16, root_site: &Site) -> bool {
	let n = graph.node(node);

	// Already culled ancestrally.
	if n.is_culled() {
		return true;
	}

	// The root node of a prim index is never culled; if needed it is
	// culled when attached to another prim index by the arc adder.
	if n.is_root_node() {
		return false;
	}

	// Nodes that denote the addition of a new arc introduce dependencies
	// and must stay discoverable, even when the arc targets a site with
	// no prim specs at all.
	if graph.depth_below_introduction(node) == 0 {
		return false;
	}

	// Symmetry is composed across namespace ancestors before arcs, so
	// any node that provides symmetry info directly or ancestrally must
	// stay.
	if n.has_symmetry() {
		return false;
	}

	// Subroot prim inherits in the root layer stack must stay: because
	// of referencing, their composed-scene sites exist even when the
	// root layer stack has no specs for them, and consumers enumerate
	// inherited bases through these nodes. Root prim inherits have no
	// such guarantee and may be culled. The origin root's introduction
	// path decides, since implied inherits can be introduced from a
	// subroot path even when the original inherit targets a root prim.
	if n.arc_type == ArcType::Inherit && Arc::ptr_eq(&n.layer_stack, &root_site.layer_stack) {
		let origin_node = if n.origin_index == n.parent_index {
			node
		} else {
			graph.origin_root_node(node)
		};
		if !graph.path_at_introduction(origin_node).is_root_prim_path() {
			return false;
		}
	}

	// An unculled subtree keeps its ancestors.
	for child in graph.children(node) {
		if !graph.node(child).is_culled() {
			return false;
		}
	}

	if n.has_specs() && n.can_contribute_specs() {
		return false;
	}

	true
}

// Recursively cull subtrees at and under the given node, bottom-up.
fn cull_subtrees_with_no_opinions(graph: &mut PrimIndexGraph, node: u16, root_site: &Site) {
	for child in graph.children(node) {
		// Specializes arcs keep duplicate node structure in the graph by
		// design; culling beneath them would have to be kept consistent
		// in both copies, so they are skipped entirely.
		if is_specialize_arc(graph.node(child).arc_type) {
			continue;
		}
		cull_subtrees_with_no_opinions(graph, child, root_site);
	}

	if node_can_be_culled(graph, node, root_site) {
		graph.node_mut(node).set_culled(true);
	}
}

////////////////////////////////////////////////////////////////////////
// Index construction

// Re-derive per-node state after the ancestor's graph was rewritten for a
// child site one namespace level deeper.
fn convert_node_for_child(
	graph: &mut PrimIndexGraph,
	node: u16,
	inputs: &PrimIndexInputs,
	is_root: bool,
) {
	// The child site sits deeper in namespace, so specs may be gone.
	if graph.node(node).has_specs() {
		let n = graph.node(node);
		let has_specs = compose_site_has_prim_specs(&n.layer_stack, &n.site_path);
		graph.node_mut(node).set_has_specs(has_specs);
	}

	// Inert nodes are placeholders with no opinions to contribute, so
	// this state is skipped for them. A private parent permission is
	// inherited; otherwise it is recomputed here, and likewise symmetry.
	if !inputs.usd && !graph.node(node).is_inert() && graph.node(node).has_specs() {
		if graph.node(node).permission == sdf::Permission::Public {
			let n = graph.node(node);
			let permission = compose_site_permission(&n.layer_stack, &n.site_path);
			graph.node_mut(node).permission = permission;
		}
		if !graph.node(node).has_symmetry() {
			let n = graph.node(node);
			let has_symmetry = compose_site_has_symmetry(&n.layer_stack, &n.site_path);
			graph.node_mut(node).set_has_symmetry(has_symmetry);
		}
	}

	for child in graph.children(node) {
		convert_node_for_child(graph, child, inputs, false);
	}

	// Initial child nodes are always due to their parent, except the
	// root node.
	if !is_root {
		graph.node_mut(node).set_is_due_to_ancestor(true);
	}
}

// Mark nodes of an instanceable ancestor graph that cannot contribute
// opinions about name children as inert: beneath an instance, opinions
// must come from within the prototype, i.e. across the ancestor's direct
// arcs. Nodes reached only through ancestral arcs (the root included) are
// restricted.
fn disable_non_instanceable_nodes(graph: &mut PrimIndexGraph, node: u16, parent_instanceable: bool) {
	let direct_arc =
		!graph.node(node).is_root_node() && !graph.node(node).is_due_to_ancestor();
	let instanceable = parent_instanceable || direct_arc;
	if !instanceable {
		graph.node_mut(node).set_inert(true);
	}
	for child in graph.children(node) {
		disable_non_instanceable_nodes(graph, child, instanceable);
	}
}

// Establish the initial index contents from the namespace parent: either
// the cache's memoized parent index or a recursive build, adjusted to the
// child site.
#[allow(clippy::too_many_arguments)]
fn build_initial_prim_index_from_ancestor(
	site: &Site,
	root_site: &Site,
	ancestor_recursion_depth: usize,
	previous_frame: Option<&StackFrame<'_>>,
	evaluate_implied_specializes: bool,
	root_node_should_contribute_specs: bool,
	inputs: &PrimIndexInputs<'_>,
	outputs: &mut PrimIndexOutputs,
) {
	let mut ancestor_is_instanceable = false;
	let mut built_from_cache = false;

	// Ask the cache for the parent prim index when the request is in the
	// cache's layer stack with equivalent inputs and nothing about this
	// build (a recursive frame, deferred implied specializes) makes the
	// memoized answer wrong.
	if previous_frame.is_none()
		&& evaluate_implied_specializes
		&& let Some(cache) = inputs.cache
		&& Arc::ptr_eq(&cache.layer_stack(), &site.layer_stack)
		&& cache.inputs_are_equivalent_to(inputs)
	{
		let parent_index = inputs
			.parent_index
			.cloned()
			.or_else(|| cache.computed_prim_index(&site.path.parent_path()));
		if let Some(parent_index) = parent_index {
			debug!(parent = %site.path.parent_path(), "retrieved ancestor index from cache");
			ancestor_is_instanceable = parent_index.is_instanceable();
			outputs.prim_index.graph = parent_index.graph.unfinalized_clone();
			built_from_cache = true;
		}
	}

	if !built_from_cache {
		// Build the prim index for the site's parent. Variants are
		// always evaluated so ancestral opinions are picked up.
		let parent_site = Site::new(site.layer_stack.clone(), site.path.parent_path());
		build_prim_index(
			parent_site.clone(),
			parent_site,
			ancestor_recursion_depth + 1,
			evaluate_implied_specializes,
			true,
			true,
			previous_frame,
			inputs,
			outputs,
		);
		ancestor_is_instanceable = compute_is_instanceable(&outputs.prim_index);
	}

	// The payload flag and state belong to the prim itself, not its
	// ancestors.
	outputs.payload_state = PayloadState::NoPayload;

	let graph = &mut outputs.prim_index.graph;
	graph.set_has_payloads(false);

	// Opinions in restricted locations beneath an instance are ignored.
	if ancestor_is_instanceable {
		disable_non_instanceable_nodes(graph, 0, false);
	}

	// Adjust the parent graph for this child.
	graph.append_child_name_to_all_sites(&site.path);

	convert_node_for_child(graph, 0, inputs, true);

	if inputs.cull {
		cull_subtrees_with_no_opinions(graph, 0, root_site);
	}

	// The caller may want the root to carry no specs of its own; note
	// the instancing restriction may already have made it inert.
	if !root_node_should_contribute_specs {
		graph.node_mut(0).set_inert(true);
	}
}

/// Build a prim index for `site` into `outputs`: produce the initial
/// graph, seed tasks for every discovered arc kind, and drain the queue
/// in priority order until no work remains.
#[allow(clippy::too_many_arguments)]
pub(crate) fn build_prim_index<'a, 'b>(
	site: Site,
	root_site: Site,
	ancestor_recursion_depth: usize,
	evaluate_implied_specializes: bool,
	evaluate_variants: bool,
	root_node_should_contribute_specs: bool,
	previous_frame: Option<&'a StackFrame<'a>>,
	inputs: &'a PrimIndexInputs<'b>,
	outputs: &'a mut PrimIndexOutputs,
) {
	debug_assert!(
		site.path.is_absolute_root_or_prim_path() || site.path.is_prim_variant_selection_path(),
		"<{}> must identify a prim or the pseudo-root",
		site.path
	);
	debug!(site = %site, depth = ancestor_recursion_depth, "building prim index");

	if site.path.is_absolute_root() {
		// Base case for the pseudo-root: a single site. The pseudo-root
		// spec exists implicitly, but that is not assumed here. No
		// composition arcs can live on the pseudo-root, so nothing else
		// remains to do.
		let has_specs = compose_site_has_prim_specs(&site.layer_stack, &site.path);
		let graph = PrimIndexGraph::new(site, inputs.usd);
		outputs.prim_index.graph = graph;
		outputs.prim_index.graph.node_mut(0).set_has_specs(has_specs);
		return;
	} else if site.path.is_prim_variant_selection_path() {
		// Variant selection paths do not recurse to the parent for
		// ancestral opinions: variant arcs are evaluated while the
		// parent path site itself is indexed, which already accounts for
		// ancestral opinions about the variant.
		let has_specs = compose_site_has_prim_specs(&site.layer_stack, &site.path);
		let graph = PrimIndexGraph::new(site, inputs.usd);
		outputs.prim_index.graph = graph;
		let root = outputs.prim_index.graph.node_mut(0);
		root.set_has_specs(has_specs);
		root.set_inert(!root_node_should_contribute_specs);
	} else {
		// Start from the namespace parent's index, to account for
		// references and other arcs introduced by ancestors that
		// contribute opinions to this child.
		build_initial_prim_index_from_ancestor(
			&site,
			&root_site,
			ancestor_recursion_depth,
			previous_frame,
			evaluate_implied_specializes,
			root_node_should_contribute_specs,
			inputs,
			outputs,
		);
	}

	let mut indexer = PrimIndexer {
		root_site,
		ancestor_recursion_depth,
		inputs,
		outputs,
		previous_frame,
		tasks: TaskQueue::new(),
		evaluate_implied_specializes,
		evaluate_variants,
	};
	indexer.add_tasks_for_root_node(0);

	// Process the task list to completion.
	while let Some(task) = indexer.tasks.pop(&indexer.outputs.prim_index.graph) {
		match task.kind {
			TaskKind::EvalNodeRelocations => indexer.eval_node_relocations(task.node),
			TaskKind::EvalImpliedRelocations => indexer.eval_implied_relocations(task.node),
			TaskKind::EvalNodeReferences => indexer.eval_node_references(task.node),
			TaskKind::EvalNodePayload => indexer.eval_node_payloads(task.node),
			TaskKind::EvalNodeInherits => indexer.eval_node_inherits(task.node),
			TaskKind::EvalImpliedClasses => indexer.eval_implied_classes(task.node),
			TaskKind::EvalNodeSpecializes => indexer.eval_node_specializes(task.node),
			TaskKind::EvalImpliedSpecializes => indexer.eval_implied_specializes(task.node),
			TaskKind::EvalNodeVariantSets => indexer.eval_node_variant_sets(task.node),
			TaskKind::EvalNodeVariantAuthored => {
				indexer.eval_node_authored_variant(task.node, &task.vset_name, task.vset_num);
			}
			TaskKind::EvalNodeVariantFallback => {
				indexer.eval_node_fallback_variant(task.node, &task.vset_name, task.vset_num);
			}
			TaskKind::EvalNodeVariantNoneFound => {
				// A marker for RetryVariantTasks; nothing to do.
			}
		}
	}
}
