use crate::sdf;
use std::sync::{Arc, OnceLock};

/// A function that maps paths from one namespace to another, together with
/// a time offset between the two.
///
/// A map function is a table of source/target path pairs. A path is mapped
/// by finding the pair whose source is its longest prefix and translating
/// that prefix to the pair's target; paths outside every pair's domain do
/// not map.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MapFunction {
	pairs: Vec<(sdf::Path, sdf::Path)>,
	time_offset: sdf::Retiming,
}

impl MapFunction {
	pub fn new(mut pairs: Vec<(sdf::Path, sdf::Path)>, time_offset: sdf::Retiming) -> Self {
		pairs.sort();
		pairs.dedup();

		// Canonicalize: drop any pair whose mapping is already implied by
		// a broader pair. Shadow pairs would otherwise win longest-prefix
		// lookups in one direction and lose them in the other.
		let canonical = (0..pairs.len())
			.filter(|&index| {
				let (source, target) = &pairs[index];
				let implied = pairs
					.iter()
					.enumerate()
					.filter(|&(other, (other_source, _))| {
						other != index && source.has_prefix(other_source)
					})
					.max_by_key(|(_, (other_source, _))| other_source.element_count())
					.map(|(_, (other_source, other_target))| {
						source.replace_prefix(other_source, other_target)
					});
				implied.as_ref() != Some(target)
			})
			.map(|index| pairs[index].clone())
			.collect();

		Self {
			pairs: canonical,
			time_offset,
		}
	}

	/// The identity function: every path maps to itself.
	pub fn identity() -> Self {
		Self::new(
			vec![(
				sdf::Path::absolute_root_path(),
				sdf::Path::absolute_root_path(),
			)],
			sdf::Retiming::default(),
		)
	}

	/// A function mapping a single source path to a single target path.
	pub fn pair(source: sdf::Path, target: sdf::Path, time_offset: sdf::Retiming) -> Self {
		Self::new(vec![(source, target)], time_offset)
	}

	pub fn pairs(&self) -> &[(sdf::Path, sdf::Path)] {
		&self.pairs
	}

	pub fn time_offset(&self) -> sdf::Retiming {
		self.time_offset
	}

	pub fn is_identity(&self) -> bool {
		self.has_root_identity() && self.pairs.len() == 1 && self.time_offset.is_identity()
	}

	pub fn has_root_identity(&self) -> bool {
		let root = sdf::Path::absolute_root_path();
		self.pairs.iter().any(|(s, t)| *s == root && *t == root)
	}

	/// Map a path in the source namespace to the target namespace.
	/// Returns the empty path if the path is outside the function's domain.
	pub fn map_source_to_target(&self, path: &sdf::Path) -> sdf::Path {
		self.map(path, |&(ref s, ref t)| (s, t))
	}

	/// Map a path in the target namespace back to the source namespace.
	pub fn map_target_to_source(&self, path: &sdf::Path) -> sdf::Path {
		self.map(path, |&(ref s, ref t)| (t, s))
	}

	fn map<'a>(
		&'a self,
		path: &sdf::Path,
		dir: impl Fn(&'a (sdf::Path, sdf::Path)) -> (&'a sdf::Path, &'a sdf::Path),
	) -> sdf::Path {
		if path.is_empty() {
			return sdf::Path::empty_path();
		}

		let mut best: Option<(&sdf::Path, &sdf::Path)> = None;
		for pair in &self.pairs {
			let (from, to) = dir(pair);
			if path.has_prefix(from)
				&& best.is_none_or(|(b, _)| from.element_count() > b.element_count())
			{
				best = Some((from, to));
			}
		}

		match best {
			Some((from, to)) => path.replace_prefix(from, to),
			None => sdf::Path::empty_path(),
		}
	}

	/// Compose this function over `inner`: the result maps a path through
	/// `inner` first, then through this function.
	pub fn compose(&self, inner: &MapFunction) -> MapFunction {
		if self.is_identity() {
			return inner.clone();
		}
		if inner.is_identity() {
			return self.clone();
		}

		let mut pairs = Vec::new();
		for (source, target) in &inner.pairs {
			let mapped = self.map_source_to_target(target);
			if !mapped.is_empty() {
				pairs.push((source.clone(), mapped));
			}
		}
		for (source, target) in &self.pairs {
			let pulled_back = inner.map_target_to_source(source);
			if !pulled_back.is_empty() && !pairs.iter().any(|(s, _)| *s == pulled_back) {
				pairs.push((pulled_back, target.clone()));
			}
		}

		MapFunction::new(pairs, self.time_offset * inner.time_offset)
	}

	pub fn inverse(&self) -> MapFunction {
		MapFunction::new(
			self.pairs.iter().map(|(s, t)| (t.clone(), s.clone())).collect(),
			self.time_offset.inv(),
		)
	}

	/// This function plus the root identity pair, if not already present.
	pub fn with_root_identity(&self) -> MapFunction {
		if self.has_root_identity() {
			return self.clone();
		}
		let mut pairs = self.pairs.clone();
		pairs.push((
			sdf::Path::absolute_root_path(),
			sdf::Path::absolute_root_path(),
		));
		MapFunction::new(pairs, self.time_offset)
	}
}

enum ExprOp {
	Constant(MapFunction),
	Compose(MapExpression, MapExpression),
	Inverse(MapExpression),
	AddRootIdentity(MapExpression),
}

struct ExprNode {
	op: ExprOp,
	cached: OnceLock<MapFunction>,
}

/// A lazily-composed expression tree of map functions.
///
/// Expressions are immutable and cheap to clone; evaluation is memoized
/// per node, so shared subexpressions evaluate once.
#[derive(Clone)]
pub struct MapExpression {
	node: Arc<ExprNode>,
}

impl MapExpression {
	fn new(op: ExprOp) -> Self {
		Self {
			node: Arc::new(ExprNode {
				op,
				cached: OnceLock::new(),
			}),
		}
	}

	pub fn constant(function: MapFunction) -> Self {
		Self::new(ExprOp::Constant(function))
	}

	pub fn identity() -> Self {
		Self::constant(MapFunction::identity())
	}

	/// An expression applying `inner` first, then this expression.
	pub fn compose(&self, inner: &MapExpression) -> Self {
		Self::new(ExprOp::Compose(self.clone(), inner.clone()))
	}

	pub fn inverse(&self) -> Self {
		Self::new(ExprOp::Inverse(self.clone()))
	}

	pub fn add_root_identity(&self) -> Self {
		Self::new(ExprOp::AddRootIdentity(self.clone()))
	}

	/// Evaluate the expression to its composed function.
	pub fn evaluate(&self) -> &MapFunction {
		self.node.cached.get_or_init(|| match &self.node.op {
			ExprOp::Constant(function) => function.clone(),
			ExprOp::Compose(outer, inner) => outer.evaluate().compose(inner.evaluate()),
			ExprOp::Inverse(expr) => expr.evaluate().inverse(),
			ExprOp::AddRootIdentity(expr) => expr.evaluate().with_root_identity(),
		})
	}

	pub fn is_constant_identity(&self) -> bool {
		match &self.node.op {
			ExprOp::Constant(function) => function.is_identity(),
			_ => self.evaluate().is_identity(),
		}
	}

	pub fn map_source_to_target(&self, path: &sdf::Path) -> sdf::Path {
		self.evaluate().map_source_to_target(path)
	}

	pub fn map_target_to_source(&self, path: &sdf::Path) -> sdf::Path {
		self.evaluate().map_target_to_source(path)
	}

	pub fn time_offset(&self) -> sdf::Retiming {
		self.evaluate().time_offset()
	}
}

impl std::fmt::Debug for MapExpression {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		f.debug_tuple("MapExpression").field(self.evaluate()).finish()
	}
}

impl PartialEq for MapExpression {
	fn eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.node, &other.node) || self.evaluate() == other.evaluate()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn p(s: &str) -> sdf::Path {
		sdf::Path::from(s)
	}

	#[test]
	fn map_across_pair() {
		let f = MapFunction::pair(p("/Class"), p("/Model"), sdf::Retiming::default());
		assert_eq!(f.map_source_to_target(&p("/Class/Child")), p("/Model/Child"));
		assert_eq!(f.map_target_to_source(&p("/Model")), p("/Class"));
		assert!(f.map_source_to_target(&p("/Other")).is_empty());
	}

	#[test]
	fn root_identity_widens_domain() {
		let f = MapFunction::pair(p("/Class"), p("/Model"), sdf::Retiming::default())
			.with_root_identity();
		assert_eq!(f.map_source_to_target(&p("/Other")), p("/Other"));
		// The more specific pair still wins over the root identity.
		assert_eq!(f.map_source_to_target(&p("/Class")), p("/Model"));
	}

	#[test]
	fn compose_reference_over_inherit() {
		// An inherit /Sullivan/_class_Rig -> /Sullivan/Rig transferred
		// across a reference /Sullivan -> /Sullivan_1 becomes the implied
		// class mapping /Sullivan_1/_class_Rig -> /Sullivan_1/Rig.
		let inherit = MapFunction::pair(
			p("/Sullivan/_class_Rig"),
			p("/Sullivan/Rig"),
			sdf::Retiming::default(),
		);
		let reference = MapFunction::pair(
			p("/Sullivan"),
			p("/Sullivan_1"),
			sdf::Retiming::default(),
		);
		let implied = reference.compose(&inherit.compose(&reference.inverse()));
		assert_eq!(
			implied.map_source_to_target(&p("/Sullivan_1/_class_Rig")),
			p("/Sullivan_1/Rig")
		);
	}

	#[test]
	fn expression_memoizes() {
		let expr = MapExpression::constant(MapFunction::pair(
			p("/A"),
			p("/B"),
			sdf::Retiming::default(),
		))
		.add_root_identity();
		let first = expr.evaluate() as *const MapFunction;
		let second = expr.evaluate() as *const MapFunction;
		assert_eq!(first, second);
		assert!(expr.evaluate().has_root_identity());
	}

	#[test]
	fn canonicalization_drops_shadowed_pairs() {
		let f = MapFunction::new(
			vec![
				(p("/"), p("/")),
				(p("/R"), p("/R")),
				(p("/R/C"), p("/R/I")),
			],
			sdf::Retiming::default(),
		);
		assert_eq!(f.pairs().len(), 2);
		// The shadow pair must not hide the specific mapping in the
		// target-to-source direction.
		assert_eq!(f.map_target_to_source(&p("/R/I")), p("/R/C"));
		assert_eq!(f.map_target_to_source(&p("/R")), p("/R"));
	}

	#[test]
	fn identity_composition_shortcuts() {
		let f = MapFunction::pair(p("/A"), p("/B"), sdf::Retiming::default());
		assert_eq!(MapFunction::identity().compose(&f), f);
		assert_eq!(f.compose(&MapFunction::identity()), f);
		assert!(MapExpression::identity().is_constant_identity());
	}
}
