use super::layer_stack::{LayerStack, Site};
use super::map_expr::MapExpression;
use super::ArcType;
use crate::sdf;
use std::sync::Arc;

// Index used to represent an invalid node.
pub const INVALID_NODE_INDEX: u16 = u16::MAX;

bitflags::bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	struct NodeFlags: u8 {
		/// The node contributes no opinions but remains for dependencies.
		const INERT = 1 << 0;
		/// The node was culled; it is removed when the graph is finalized.
		const CULLED = 1 << 1;
		/// A prim spec exists at the node's site.
		const HAS_SPECS = 1 << 2;
		/// Symmetry information is authored at the node's site.
		const HAS_SYMMETRY = 1 << 3;
		/// The node is blocked by a stronger private site.
		const RESTRICTED = 1 << 4;
		/// The node was introduced at a shallower level of namespace.
		const IS_DUE_TO_ANCESTOR = 1 << 5;
	}
}

/// The data describing one composition arc, used when inserting a node.
#[derive(Debug, Clone)]
pub struct NodeArc {
	pub arc_type: ArcType,
	pub map_to_parent: MapExpression,
	/// The node this arc was propagated from; equals the introducing
	/// parent for direct arcs.
	pub origin_index: u16,
	/// Count of namespace levels of the parent's path when this arc was
	/// introduced (variant selections do not count).
	pub namespace_depth: usize,
	/// The position of this arc among its siblings at the origin.
	pub sibling_num_at_origin: usize,
}

/// A vertex of the prim index: one site of scene description plus the arc
/// that brought it into the graph.
#[derive(Debug, Clone)]
pub struct Node {
	pub layer_stack: Arc<LayerStack>,
	pub site_path: sdf::Path,
	pub arc_type: ArcType,
	pub map_to_parent: MapExpression,

	pub parent_index: u16,
	pub origin_index: u16,

	// The indices of the first/last child, previous/next sibling.
	// The previous sibling index of a first child and the next
	// sibling index of a last child are `INVALID_NODE_INDEX`
	// (i.e. they form a list, not a ring).
	pub first_child_index: u16,
	pub last_child_index: u16,
	pub prev_sibling_index: u16,
	pub next_sibling_index: u16,

	pub namespace_depth: u16,
	pub sibling_num_at_origin: u16,
	pub permission: sdf::Permission,
	flags: NodeFlags,
}

impl Node {
	fn new(layer_stack: Arc<LayerStack>, site_path: sdf::Path) -> Self {
		Self {
			layer_stack,
			site_path,
			arc_type: ArcType::Root,
			map_to_parent: MapExpression::identity(),
			parent_index: INVALID_NODE_INDEX,
			origin_index: INVALID_NODE_INDEX,
			first_child_index: INVALID_NODE_INDEX,
			last_child_index: INVALID_NODE_INDEX,
			prev_sibling_index: INVALID_NODE_INDEX,
			next_sibling_index: INVALID_NODE_INDEX,
			namespace_depth: 0,
			sibling_num_at_origin: 0,
			permission: sdf::Permission::Public,
			flags: NodeFlags::default(),
		}
	}

	pub fn site(&self) -> Site {
		Site::new(self.layer_stack.clone(), self.site_path.clone())
	}

	pub fn is_inert(&self) -> bool {
		self.flags.contains(NodeFlags::INERT)
	}

	pub fn set_inert(&mut self, inert: bool) {
		self.flags.set(NodeFlags::INERT, inert);
	}

	pub fn is_culled(&self) -> bool {
		self.flags.contains(NodeFlags::CULLED)
	}

	pub fn set_culled(&mut self, culled: bool) {
		self.flags.set(NodeFlags::CULLED, culled);
	}

	pub fn has_specs(&self) -> bool {
		self.flags.contains(NodeFlags::HAS_SPECS)
	}

	pub fn set_has_specs(&mut self, has_specs: bool) {
		self.flags.set(NodeFlags::HAS_SPECS, has_specs);
	}

	pub fn has_symmetry(&self) -> bool {
		self.flags.contains(NodeFlags::HAS_SYMMETRY)
	}

	pub fn set_has_symmetry(&mut self, has_symmetry: bool) {
		self.flags.set(NodeFlags::HAS_SYMMETRY, has_symmetry);
	}

	pub fn is_restricted(&self) -> bool {
		self.flags.contains(NodeFlags::RESTRICTED)
	}

	pub fn set_restricted(&mut self, restricted: bool) {
		self.flags.set(NodeFlags::RESTRICTED, restricted);
	}

	pub fn is_due_to_ancestor(&self) -> bool {
		self.flags.contains(NodeFlags::IS_DUE_TO_ANCESTOR)
	}

	pub fn set_is_due_to_ancestor(&mut self, due: bool) {
		self.flags.set(NodeFlags::IS_DUE_TO_ANCESTOR, due);
	}

	/// A node may contribute opinions unless it is inert or blocked by
	/// permissions.
	pub fn can_contribute_specs(&self) -> bool {
		!self.is_inert() && !self.is_restricted()
	}

	pub fn is_root_node(&self) -> bool {
		self.parent_index == INVALID_NODE_INDEX
	}
}

/// Errors raised by graph mutation when a capacity limit is hit. The
/// builder reports each of these at most once per build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphError {
	IndexCapacityExceeded,
	ArcCapacityExceeded,
	ArcNamespaceDepthCapacityExceeded,
}

/// Arena-backed graph of prim index nodes.
///
/// Nodes live in a single append-only arena; references between nodes are
/// indices. Node indices are assigned in strict insertion order, and a
/// parent is always inserted before its children, so comparing indices
/// gives a cheap descendants-first sort. That ordering is load-bearing for
/// implied class evaluation; nothing may perturb it.
#[derive(Debug, Clone, Default)]
pub struct PrimIndexGraph {
	nodes: Vec<Node>,
	has_payloads: bool,
	is_instanceable: bool,
	usd: bool,
	finalized: bool,
}

impl PrimIndexGraph {
	pub fn new(site: Site, usd: bool) -> Self {
		let mut graph = Self {
			nodes: Vec::new(),
			has_payloads: false,
			is_instanceable: false,
			usd,
			finalized: false,
		};
		graph.nodes.push(Node::new(site.layer_stack, site.path));
		graph
	}

	pub fn root_node_index(&self) -> u16 {
		0
	}

	pub fn node(&self, index: u16) -> &Node {
		&self.nodes[index as usize]
	}

	pub fn node_mut(&mut self, index: u16) -> &mut Node {
		&mut self.nodes[index as usize]
	}

	pub fn node_count(&self) -> usize {
		self.nodes.len()
	}

	pub fn root_path(&self) -> &sdf::Path {
		&self.nodes[0].site_path
	}

	pub fn has_payloads(&self) -> bool {
		self.has_payloads
	}

	pub fn set_has_payloads(&mut self, has_payloads: bool) {
		self.has_payloads = has_payloads;
	}

	pub fn is_instanceable(&self) -> bool {
		self.is_instanceable
	}

	pub fn set_is_instanceable(&mut self, is_instanceable: bool) {
		self.is_instanceable = is_instanceable;
	}

	pub fn is_usd(&self) -> bool {
		self.usd
	}

	pub fn is_finalized(&self) -> bool {
		self.finalized
	}

	/// A mutable copy of this graph, used when a memoized ancestor index
	/// becomes the starting point of a new build.
	pub fn unfinalized_clone(&self) -> Self {
		let mut clone = self.clone();
		clone.finalized = false;
		clone
	}

	/// The children of `parent` in strength order (insertion order within
	/// one arc type).
	pub fn children(&self, parent: u16) -> Vec<u16> {
		let mut indices = Vec::new();
		let mut current = self.nodes[parent as usize].first_child_index;
		while current != INVALID_NODE_INDEX {
			indices.push(current);
			current = self.nodes[current as usize].next_sibling_index;
		}
		indices
	}

	/// All node indices in strong-to-weak order: a depth-first traversal
	/// from the root with children in strength order.
	pub fn node_range_strong_to_weak(&self) -> Vec<u16> {
		let mut order = Vec::with_capacity(self.nodes.len());
		let mut stack = vec![0u16];
		while let Some(index) = stack.pop() {
			order.push(index);
			let children = self.children(index);
			for child in children.into_iter().rev() {
				stack.push(child);
			}
		}
		order
	}

	/// The nodes introduced by arcs of one kind, in strong-to-weak order.
	pub fn node_range_for_arc_type(&self, arc_type: ArcType) -> Vec<u16> {
		self.node_range_strong_to_weak()
			.into_iter()
			.filter(|&index| self.nodes[index as usize].arc_type == arc_type)
			.collect()
	}

	/// Compare two nodes by strength. The stronger node orders first.
	pub fn compare_strength(&self, a: u16, b: u16) -> std::cmp::Ordering {
		if a == b {
			return std::cmp::Ordering::Equal;
		}
		let order = self.node_range_strong_to_weak();
		let pos_a = order.iter().position(|&n| n == a);
		let pos_b = order.iter().position(|&n| n == b);
		pos_a.cmp(&pos_b)
	}

	/// Look up the node occupying `site`, if any.
	pub fn node_using_site(&self, site: &Site) -> Option<u16> {
		self.nodes.iter().position(|node| {
			Arc::ptr_eq(&node.layer_stack, &site.layer_stack) && node.site_path == site.path
		}).map(|index| index as u16)
	}

	/// Insert a new child node under `parent` for the given arc, keeping
	/// children in strength order.
	pub fn insert_child(
		&mut self,
		parent: u16,
		site_path: sdf::Path,
		layer_stack: Arc<LayerStack>,
		arc: &NodeArc,
	) -> Result<u16, GraphError> {
		debug_assert!(!self.finalized, "graph is finalized");
		if self.nodes.len() + 1 >= INVALID_NODE_INDEX as usize {
			return Err(GraphError::IndexCapacityExceeded);
		}
		if arc.namespace_depth >= u16::MAX as usize {
			return Err(GraphError::ArcNamespaceDepthCapacityExceeded);
		}
		if arc.sibling_num_at_origin >= u16::MAX as usize
			|| self.children(parent).len() + 1 >= u16::MAX as usize
		{
			return Err(GraphError::ArcCapacityExceeded);
		}

		let mut node = Node::new(layer_stack, site_path);
		node.arc_type = arc.arc_type;
		node.map_to_parent = arc.map_to_parent.clone();
		node.parent_index = parent;
		node.origin_index = arc.origin_index;
		node.namespace_depth = arc.namespace_depth as u16;
		node.sibling_num_at_origin = arc.sibling_num_at_origin as u16;

		let child = self.nodes.len() as u16;
		self.nodes.push(node);
		self.link_child(parent, child);
		Ok(child)
	}

	/// Insert an entire subgraph as a child of `parent`. The subgraph's
	/// root node takes on the given arc; all other relationships inside
	/// the subgraph are preserved.
	pub fn insert_child_subgraph(
		&mut self,
		parent: u16,
		subgraph: &PrimIndexGraph,
		arc: &NodeArc,
	) -> Result<u16, GraphError> {
		debug_assert!(!self.finalized, "graph is finalized");
		if self.nodes.len() + subgraph.nodes.len() >= INVALID_NODE_INDEX as usize {
			return Err(GraphError::IndexCapacityExceeded);
		}
		if arc.namespace_depth >= u16::MAX as usize {
			return Err(GraphError::ArcNamespaceDepthCapacityExceeded);
		}
		if self.children(parent).len() + 1 >= u16::MAX as usize {
			return Err(GraphError::ArcCapacityExceeded);
		}

		let offset = self.nodes.len() as u16;
		let remap = |index: u16| -> u16 {
			if index == INVALID_NODE_INDEX {
				INVALID_NODE_INDEX
			} else {
				index + offset
			}
		};

		for node in &subgraph.nodes {
			let mut copy = node.clone();
			copy.parent_index = remap(copy.parent_index);
			copy.origin_index = remap(copy.origin_index);
			copy.first_child_index = remap(copy.first_child_index);
			copy.last_child_index = remap(copy.last_child_index);
			copy.prev_sibling_index = remap(copy.prev_sibling_index);
			copy.next_sibling_index = remap(copy.next_sibling_index);
			self.nodes.push(copy);
		}

		let new_root = offset;
		{
			let node = &mut self.nodes[new_root as usize];
			node.arc_type = arc.arc_type;
			node.map_to_parent = arc.map_to_parent.clone();
			node.parent_index = parent;
			node.origin_index = arc.origin_index;
			node.namespace_depth = arc.namespace_depth as u16;
			node.sibling_num_at_origin = arc.sibling_num_at_origin as u16;
		}
		self.link_child(parent, new_root);

		if subgraph.has_payloads {
			self.has_payloads = true;
		}
		Ok(new_root)
	}

	// Insert child in arc strength order: weaker arcs go later, arcs of
	// equal strength keep insertion order.
	fn link_child(&mut self, parent: u16, child: u16) {
		let strength = arc_strength(self.nodes[child as usize].arc_type);

		let mut insert_after = INVALID_NODE_INDEX;
		let mut current = self.nodes[parent as usize].first_child_index;
		while current != INVALID_NODE_INDEX {
			if strength < arc_strength(self.nodes[current as usize].arc_type) {
				break;
			}
			insert_after = current;
			current = self.nodes[current as usize].next_sibling_index;
		}

		if insert_after == INVALID_NODE_INDEX {
			let old_first = self.nodes[parent as usize].first_child_index;
			self.nodes[parent as usize].first_child_index = child;
			if old_first != INVALID_NODE_INDEX {
				self.nodes[old_first as usize].prev_sibling_index = child;
				self.nodes[child as usize].next_sibling_index = old_first;
			} else {
				self.nodes[parent as usize].last_child_index = child;
			}
		} else {
			let next = self.nodes[insert_after as usize].next_sibling_index;
			self.nodes[insert_after as usize].next_sibling_index = child;
			self.nodes[child as usize].prev_sibling_index = insert_after;
			self.nodes[child as usize].next_sibling_index = next;
			if next != INVALID_NODE_INDEX {
				self.nodes[next as usize].prev_sibling_index = child;
			} else {
				self.nodes[parent as usize].last_child_index = child;
			}
		}
	}

	/// The expression mapping this node's namespace to the graph root's.
	pub fn map_to_root(&self, node: u16) -> MapExpression {
		let mut expr = MapExpression::identity();
		let mut current = node;
		while current != INVALID_NODE_INDEX && !self.nodes[current as usize].is_root_node() {
			expr = self.nodes[current as usize].map_to_parent.compose(&expr);
			current = self.nodes[current as usize].parent_index;
		}
		expr
	}

	/// Count of namespace levels between this node's introduction and the
	/// current level of namespace being composed.
	pub fn depth_below_introduction(&self, node: u16) -> usize {
		let root_depth = self.root_path().non_variant_element_count();
		root_depth.saturating_sub(self.nodes[node as usize].namespace_depth as usize)
	}

	/// The node's path when its arc was introduced, at a shallower level
	/// of namespace for nodes brought in by ancestors.
	pub fn path_at_introduction(&self, node: u16) -> sdf::Path {
		let mut path = self.nodes[node as usize].site_path.clone();
		for _ in 0..self.depth_below_introduction(node) {
			path = path.parent_path();
		}
		path
	}

	/// Walk origin links back to the node that started a chain of
	/// propagated arcs.
	pub fn origin_root_node(&self, node: u16) -> u16 {
		let mut current = node;
		loop {
			let n = &self.nodes[current as usize];
			if n.origin_index == n.parent_index || n.origin_index == INVALID_NODE_INDEX {
				return current;
			}
			current = n.origin_index;
		}
	}

	/// Rewrite every site for composing one namespace level deeper: the
	/// final element of `child_path` is appended to each node's path.
	pub fn append_child_name_to_all_sites(&mut self, child_path: &sdf::Path) {
		let name = child_path.name_token();
		for node in &mut self.nodes {
			node.site_path = node.site_path.append_child(&name);
		}
	}

	/// Finalize the graph: drop culled subtrees, compact the arena and
	/// freeze it. May be called once.
	pub fn finalize(&mut self) {
		if self.finalized {
			return;
		}
		self.finalized = true;

		if !self.nodes.iter().any(Node::is_culled) {
			return;
		}

		// A culled node's subtree is entirely culled, so keeping exactly
		// the unculled nodes preserves connectivity. Preserve arena order;
		// it defines node identity semantics.
		let mut remap = vec![INVALID_NODE_INDEX; self.nodes.len()];
		let mut kept = Vec::with_capacity(self.nodes.len());
		for (index, node) in self.nodes.iter().enumerate() {
			if !node.is_culled() {
				remap[index] = kept.len() as u16;
				kept.push(node.clone());
			}
		}

		let old_children: Vec<Vec<u16>> = (0..self.nodes.len() as u16)
			.map(|index| {
				if self.nodes[index as usize].is_culled() {
					Vec::new()
				} else {
					self.children(index)
						.into_iter()
						.filter(|&c| !self.nodes[c as usize].is_culled())
						.collect()
				}
			})
			.collect();

		for node in &mut kept {
			node.first_child_index = INVALID_NODE_INDEX;
			node.last_child_index = INVALID_NODE_INDEX;
			node.prev_sibling_index = INVALID_NODE_INDEX;
			node.next_sibling_index = INVALID_NODE_INDEX;
			node.parent_index = if node.parent_index == INVALID_NODE_INDEX {
				INVALID_NODE_INDEX
			} else {
				remap[node.parent_index as usize]
			};
			node.origin_index = if node.origin_index == INVALID_NODE_INDEX {
				INVALID_NODE_INDEX
			} else {
				remap[node.origin_index as usize]
			};
		}

		for (old_parent, children) in old_children.iter().enumerate() {
			let new_parent = remap[old_parent];
			if new_parent == INVALID_NODE_INDEX {
				continue;
			}
			let mut prev = INVALID_NODE_INDEX;
			for &old_child in children {
				let new_child = remap[old_child as usize];
				if prev == INVALID_NODE_INDEX {
					kept[new_parent as usize].first_child_index = new_child;
				} else {
					kept[prev as usize].next_sibling_index = new_child;
					kept[new_child as usize].prev_sibling_index = prev;
				}
				kept[new_parent as usize].last_child_index = new_child;
				prev = new_child;
			}
		}

		self.nodes = kept;
	}
}

/// Returns the strength value for a given arc type (lower = stronger)
/// LIVERPS order: Root(0), Inherit(1), Variant(2), Relocate(3), Reference(4), Payload(5), Specialize(6)
fn arc_strength(arc: ArcType) -> u8 {
	match arc {
		ArcType::Root => 0,
		ArcType::Inherit => 1,
		ArcType::Variant => 2,
		ArcType::Relocate => 3,
		ArcType::Reference => 4,
		ArcType::Payload => 5,
		ArcType::Specialize => 6,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pcp::LayerStack;

	fn p(s: &str) -> sdf::Path {
		sdf::Path::from(s)
	}

	fn test_graph(name: &str) -> (PrimIndexGraph, Arc<LayerStack>) {
		let layer = sdf::Layer::create(format!("graph_test_{name}.usda"));
		let stack = LayerStack::new(layer);
		(
			PrimIndexGraph::new(Site::new(stack.clone(), p("/Root")), false),
			stack,
		)
	}

	fn arc(arc_type: ArcType, origin: u16) -> NodeArc {
		NodeArc {
			arc_type,
			map_to_parent: MapExpression::identity(),
			origin_index: origin,
			namespace_depth: 1,
			sibling_num_at_origin: 0,
		}
	}

	#[test]
	fn children_follow_strength_order() {
		let (mut graph, stack) = test_graph("strength");
		let payload = graph
			.insert_child(0, p("/P"), stack.clone(), &arc(ArcType::Payload, 0))
			.unwrap();
		let inherit = graph
			.insert_child(0, p("/I"), stack.clone(), &arc(ArcType::Inherit, 0))
			.unwrap();
		let reference = graph
			.insert_child(0, p("/R"), stack.clone(), &arc(ArcType::Reference, 0))
			.unwrap();

		assert_eq!(graph.children(0), vec![inherit, reference, payload]);
		assert_eq!(
			graph.node_range_strong_to_weak(),
			vec![0, inherit, reference, payload]
		);
	}

	#[test]
	fn subgraph_insertion_remaps_links() {
		let (mut graph, stack) = test_graph("subgraph_outer");
		let (mut subgraph, sub_stack) = test_graph("subgraph_inner");
		let sub_child = subgraph
			.insert_child(0, p("/Sub/Child"), sub_stack.clone(), &arc(ArcType::Reference, 0))
			.unwrap();
		assert_eq!(sub_child, 1);

		let new_root = graph
			.insert_child_subgraph(0, &subgraph, &arc(ArcType::Reference, 0))
			.unwrap();
		assert_eq!(new_root, 1);
		assert_eq!(graph.children(new_root), vec![2]);
		assert_eq!(graph.node(2).parent_index, new_root);
		assert_eq!(graph.node(new_root).parent_index, 0);
	}

	#[test]
	fn finalize_drops_culled_subtrees() {
		let (mut graph, stack) = test_graph("finalize");
		graph
			.insert_child(0, p("/Kept"), stack.clone(), &arc(ArcType::Reference, 0))
			.unwrap();
		let culled = graph
			.insert_child(0, p("/Culled"), stack.clone(), &arc(ArcType::Payload, 0))
			.unwrap();
		let culled_child = graph
			.insert_child(culled, p("/Culled/Child"), stack.clone(), &arc(ArcType::Reference, culled))
			.unwrap();
		graph.node_mut(culled).set_culled(true);
		graph.node_mut(culled_child).set_culled(true);

		graph.finalize();
		assert_eq!(graph.node_count(), 2);
		assert_eq!(graph.children(0), vec![1]);
		assert_eq!(graph.node(1).site_path, p("/Kept"));
	}

	#[test]
	fn capacity_errors() {
		let (mut graph, stack) = test_graph("capacity");

		let mut deep = arc(ArcType::Reference, 0);
		deep.namespace_depth = u16::MAX as usize;
		assert_eq!(
			graph.insert_child(0, p("/X"), stack.clone(), &deep),
			Err(GraphError::ArcNamespaceDepthCapacityExceeded)
		);

		let mut wide = arc(ArcType::Reference, 0);
		wide.sibling_num_at_origin = u16::MAX as usize;
		assert_eq!(
			graph.insert_child(0, p("/Y"), stack.clone(), &wide),
			Err(GraphError::ArcCapacityExceeded)
		);
	}

	#[test]
	fn depth_below_introduction_tracks_namespace() {
		let (mut graph, stack) = test_graph("depth");
		let child = graph
			.insert_child(0, p("/Ref"), stack.clone(), &arc(ArcType::Reference, 0))
			.unwrap();
		assert_eq!(graph.depth_below_introduction(child), 0);

		graph.append_child_name_to_all_sites(&p("/Root/Child"));
		assert_eq!(graph.root_path(), &p("/Root/Child"));
		assert_eq!(graph.node(child).site_path, p("/Ref/Child"));
		assert_eq!(graph.depth_below_introduction(child), 1);
		assert_eq!(graph.path_at_introduction(child), p("/Ref"));
	}
}
