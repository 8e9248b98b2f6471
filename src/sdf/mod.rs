//! Scene Description Foundations

mod layer;
mod list_op;
mod path;
mod retiming;
mod schema;

pub use layer::*;
pub use list_op::*;
pub use path::*;
pub use retiming::*;
pub use schema::FIELD_KEYS;

use indexmap::IndexMap;

/// An enum that defines permission levels.
///
/// Permissions control which layers may refer to or express opinions about
/// a prim. Opinions from private sites are not visible across arcs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Permission {
	#[default]
	Public,
	Private,
}

/// Represents a reference and all its meta data.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Reference {
	/// The asset path to the external layer. Empty for internal references.
	pub asset_path: String,
	/// The path to the referenced prim in the external layer.
	pub prim_path: Path,
	/// The layer offset to transform time.
	pub layer_offset: Retiming,
}

/// Represents a payload and all its meta data.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Payload {
	/// The asset path to the external layer. Empty for internal payloads.
	pub asset_path: String,
	/// The root prim path to the referenced prim in the external layer.
	pub prim_path: Path,
	/// The layer offset to transform time.
	pub layer_offset: Retiming,
}

/// A single relocate specifying a source and target path for a relocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Relocate {
	pub source: Path,
	pub target: Path,
}

/// A map of variant set name to the selected variant.
pub type VariantSelectionMap = IndexMap<String, String>;
