use super::graph::PrimIndexGraph;
use std::collections::HashSet;

/// A task to perform on a particular node.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Task {
	pub kind: TaskKind,
	pub node: u16,
	/// Only for variant tasks.
	pub vset_name: String,
	/// Only for variant tasks.
	pub vset_num: usize,
}

impl Task {
	pub fn new(kind: TaskKind, node: u16) -> Self {
		Self {
			kind,
			node,
			vset_name: String::new(),
			vset_num: 0,
		}
	}

	pub fn variant(kind: TaskKind, node: u16, vset_name: String, vset_num: usize) -> Self {
		Self {
			kind,
			node,
			vset_name,
			vset_num,
		}
	}
}

/// This enum must be in evaluation priority order, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKind {
	EvalNodeRelocations,
	EvalImpliedRelocations,
	EvalNodeReferences,
	EvalNodePayload,
	EvalNodeInherits,
	EvalImpliedClasses,
	EvalNodeSpecializes,
	EvalImpliedSpecializes,
	EvalNodeVariantSets,
	EvalNodeVariantAuthored,
	EvalNodeVariantFallback,
	EvalNodeVariantNoneFound,
}

fn is_implied_task_kind(kind: TaskKind) -> bool {
	matches!(
		kind,
		TaskKind::EvalImpliedClasses | TaskKind::EvalImpliedSpecializes
	)
}

// Returns true when `a` has lower priority than `b`. Comparisons that need
// node strength consult the graph, so ordering reflects the graph state at
// push/pop time.
fn lower_priority(a: &Task, b: &Task, graph: &PrimIndexGraph) -> bool {
	if a.kind != b.kind {
		return a.kind > b.kind;
	}
	match a.kind {
		TaskKind::EvalNodePayload => {
			// Payloads can have dynamic file format arguments that depend
			// on non-local information, so we must process these in
			// strength order.
			graph.compare_strength(a.node, b.node) == std::cmp::Ordering::Greater
		}
		TaskKind::EvalNodeVariantAuthored | TaskKind::EvalNodeVariantFallback => {
			// Variant selections can depend on non-local information
			// so we must visit them in strength order.
			if a.node != b.node {
				graph.compare_strength(a.node, b.node) == std::cmp::Ordering::Greater
			} else {
				// Lower-number vsets have strength priority.
				a.vset_num > b.vset_num
			}
		}
		TaskKind::EvalNodeVariantNoneFound => {
			// Only needs a consistent, distinct order for distinct tasks.
			if a.node != b.node {
				a.node > b.node
			} else {
				a.vset_num > b.vset_num
			}
		}
		TaskKind::EvalImpliedClasses => {
			// Ancestor nodes must be processed after their descendants.
			// Node indices are assigned incrementally as nodes are added,
			// so a higher index can never be an ancestor of a lower one;
			// comparing indices gives descendants-first order without a
			// graph traversal.
			b.node > a.node
		}
		_ => a.node > b.node,
	}
}

/// Open tasks, maintained as a max-heap so the highest priority task pops
/// first. Implied class/specializes tasks are uniqued on insertion; the
/// propagation mechanisms re-discover them repeatedly.
#[derive(Debug, Default)]
pub struct TaskQueue {
	tasks: Vec<Task>,
	unique: HashSet<Task>,
}

impl TaskQueue {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn is_empty(&self) -> bool {
		self.tasks.is_empty()
	}

	pub fn push(&mut self, task: Task, graph: &PrimIndexGraph) {
		if is_implied_task_kind(task.kind) && !self.unique.insert(task.clone()) {
			return;
		}
		self.tasks.push(task);
		self.sift_up(self.tasks.len() - 1, graph);
	}

	/// Select the next task to perform.
	pub fn pop(&mut self, graph: &PrimIndexGraph) -> Option<Task> {
		if self.tasks.is_empty() {
			return None;
		}
		let last = self.tasks.len() - 1;
		self.tasks.swap(0, last);
		let task = self.tasks.pop().expect("queue is non-empty");
		if !self.tasks.is_empty() {
			self.sift_down(0, graph);
		}
		if is_implied_task_kind(task.kind) {
			self.unique.remove(&task);
		}
		Some(task)
	}

	/// Retry any variant sets that previously failed to find an authored
	/// selection, to take into account newly-discovered opinions.
	/// `EvalNodeVariantNoneFound` is a placeholder representing variants
	/// that were previously visited and yielded no variant; it exists
	/// solely for this function to be able to find and retry them.
	pub fn retry_variant_tasks(&mut self, graph: &PrimIndexGraph) {
		let mut changed = false;
		for task in &mut self.tasks {
			if matches!(
				task.kind,
				TaskKind::EvalNodeVariantFallback | TaskKind::EvalNodeVariantNoneFound
			) {
				task.kind = TaskKind::EvalNodeVariantAuthored;
				changed = true;
			}
		}
		if changed {
			self.heapify(graph);
		}
	}

	fn heapify(&mut self, graph: &PrimIndexGraph) {
		for index in (0..self.tasks.len() / 2).rev() {
			self.sift_down(index, graph);
		}
	}

	fn sift_up(&mut self, mut index: usize, graph: &PrimIndexGraph) {
		while index > 0 {
			let parent = (index - 1) / 2;
			if lower_priority(&self.tasks[parent], &self.tasks[index], graph) {
				self.tasks.swap(parent, index);
				index = parent;
			} else {
				break;
			}
		}
	}

	fn sift_down(&mut self, mut index: usize, graph: &PrimIndexGraph) {
		let len = self.tasks.len();
		loop {
			let left = 2 * index + 1;
			let right = 2 * index + 2;
			let mut highest = index;
			if left < len && lower_priority(&self.tasks[highest], &self.tasks[left], graph) {
				highest = left;
			}
			if right < len && lower_priority(&self.tasks[highest], &self.tasks[right], graph) {
				highest = right;
			}
			if highest == index {
				break;
			}
			self.tasks.swap(index, highest);
			index = highest;
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::pcp::{ArcType, LayerStack, MapExpression, NodeArc, Site};
	use crate::sdf;

	fn test_graph(name: &str) -> PrimIndexGraph {
		let layer = sdf::Layer::create(format!("task_test_{name}.usda"));
		let stack = LayerStack::new(layer);
		let mut graph = PrimIndexGraph::new(
			Site::new(stack.clone(), sdf::Path::from("/Root")),
			false,
		);
		for i in 0..3 {
			graph
				.insert_child(
					0,
					sdf::Path::from(format!("/Child{i}").as_str()),
					stack.clone(),
					&NodeArc {
						arc_type: ArcType::Reference,
						map_to_parent: MapExpression::identity(),
						origin_index: 0,
						namespace_depth: 1,
						sibling_num_at_origin: i,
					},
				)
				.unwrap();
		}
		graph
	}

	#[test]
	fn kinds_pop_in_priority_order() {
		let graph = test_graph("kinds");
		let mut queue = TaskQueue::new();
		queue.push(Task::new(TaskKind::EvalNodeVariantSets, 1), &graph);
		queue.push(Task::new(TaskKind::EvalNodeReferences, 1), &graph);
		queue.push(Task::new(TaskKind::EvalNodeRelocations, 1), &graph);
		queue.push(Task::new(TaskKind::EvalNodeInherits, 1), &graph);

		let kinds: Vec<TaskKind> = std::iter::from_fn(|| queue.pop(&graph))
			.map(|t| t.kind)
			.collect();
		assert_eq!(
			kinds,
			vec![
				TaskKind::EvalNodeRelocations,
				TaskKind::EvalNodeReferences,
				TaskKind::EvalNodeInherits,
				TaskKind::EvalNodeVariantSets,
			]
		);
	}

	#[test]
	fn implied_classes_run_descendants_first() {
		let graph = test_graph("implied");
		let mut queue = TaskQueue::new();
		queue.push(Task::new(TaskKind::EvalImpliedClasses, 1), &graph);
		queue.push(Task::new(TaskKind::EvalImpliedClasses, 3), &graph);
		queue.push(Task::new(TaskKind::EvalImpliedClasses, 2), &graph);

		let nodes: Vec<u16> = std::iter::from_fn(|| queue.pop(&graph))
			.map(|t| t.node)
			.collect();
		assert_eq!(nodes, vec![3, 2, 1]);
	}

	#[test]
	fn implied_tasks_are_uniqued() {
		let graph = test_graph("unique");
		let mut queue = TaskQueue::new();
		queue.push(Task::new(TaskKind::EvalImpliedClasses, 1), &graph);
		queue.push(Task::new(TaskKind::EvalImpliedClasses, 1), &graph);
		assert!(queue.pop(&graph).is_some());
		assert!(queue.pop(&graph).is_none());

		// Popping releases the uniquing slot for later re-insertion.
		queue.push(Task::new(TaskKind::EvalImpliedClasses, 1), &graph);
		assert!(queue.pop(&graph).is_some());

		// Duplicates of other kinds are allowed.
		queue.push(Task::new(TaskKind::EvalNodeReferences, 1), &graph);
		queue.push(Task::new(TaskKind::EvalNodeReferences, 1), &graph);
		assert!(queue.pop(&graph).is_some());
		assert!(queue.pop(&graph).is_some());
	}

	#[test]
	fn retry_promotes_fallback_and_none_found() {
		let graph = test_graph("retry");
		let mut queue = TaskQueue::new();
		queue.push(
			Task::variant(TaskKind::EvalNodeVariantFallback, 1, "standin".into(), 0),
			&graph,
		);
		queue.push(
			Task::variant(TaskKind::EvalNodeVariantNoneFound, 2, "lod".into(), 1),
			&graph,
		);
		queue.retry_variant_tasks(&graph);

		let mut kinds: Vec<TaskKind> = std::iter::from_fn(|| queue.pop(&graph))
			.map(|t| t.kind)
			.collect();
		kinds.dedup();
		assert_eq!(kinds, vec![TaskKind::EvalNodeVariantAuthored]);
	}

	#[test]
	fn variant_tasks_order_by_strength_then_vset() {
		let graph = test_graph("variants");
		let mut queue = TaskQueue::new();
		// Node 1 is stronger than node 2; vset 0 beats vset 1.
		queue.push(
			Task::variant(TaskKind::EvalNodeVariantAuthored, 2, "b".into(), 0),
			&graph,
		);
		queue.push(
			Task::variant(TaskKind::EvalNodeVariantAuthored, 1, "b".into(), 1),
			&graph,
		);
		queue.push(
			Task::variant(TaskKind::EvalNodeVariantAuthored, 1, "a".into(), 0),
			&graph,
		);

		let order: Vec<(u16, usize)> = std::iter::from_fn(|| queue.pop(&graph))
			.map(|t| (t.node, t.vset_num))
			.collect();
		assert_eq!(order, vec![(1, 0), (1, 1), (2, 0)]);
	}
}
