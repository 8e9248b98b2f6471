//! Prim Cache Population
//!
//! Computes prim indexes: strength-ordered graphs of the scene description
//! sites contributing opinions to a prim under composition semantics.

mod builder;
mod compose_site;
pub mod diagnostic;
mod error;
mod graph;
mod layer_stack;
mod map_expr;
mod prim_index;
mod task;

pub use builder::is_new_default_standin_behavior_enabled;
pub use compose_site::*;
pub use error::*;
pub use graph::*;
pub use layer_stack::*;
pub use map_expr::*;
pub use prim_index::*;

/// Describes the type of arc connecting two nodes in the prim index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ArcType {
	// The arcs are listed in strength order (LIVERPS).
	// Root is the root node of the prim index and has no parent node.
	Root,
	Inherit,
	Variant,
	Relocate,
	Reference,
	Payload,
	Specialize,
}

/// Returns true if the arc is an inherit or specialize arc. Class-based
/// arcs are propagated through the graph as implied arcs.
pub fn is_class_based_arc(arc_type: ArcType) -> bool {
	matches!(arc_type, ArcType::Inherit | ArcType::Specialize)
}

/// Returns true if the arc is a specialize arc.
pub fn is_specialize_arc(arc_type: ArcType) -> bool {
	matches!(arc_type, ArcType::Specialize)
}
