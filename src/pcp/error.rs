use super::{ArcType, Site};
use crate::sdf;
use thiserror::Error;

/// One site/arc step along a dependency cycle, ordered root to leaf.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleSegment {
	pub site: Site,
	pub arc_type: ArcType,
}

impl std::fmt::Display for CycleSegment {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		write!(f, "{:?} -> {}", self.arc_type, self.site)
	}
}

/// Composition errors produced while building a prim index.
///
/// Errors are values: the builder records them and keeps going, so callers
/// receive a complete prim index together with a complete error list. No
/// error terminates a build.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
	/// An arc introduced a dependency cycle. The chain lists the
	/// participating sites from root to leaf.
	#[error("cycle detected at {root_site}")]
	ArcCycle {
		root_site: Site,
		cycle: Vec<CycleSegment>,
	},

	/// An arc directly targets a private site.
	#[error("arc to private site {private_site} from {site}")]
	ArcPermissionDenied {
		root_site: Site,
		site: Site,
		private_site: Site,
		arc_type: ArcType,
	},

	/// An authored arc target is not a valid absolute prim path without
	/// variant selections.
	#[error("invalid target path <{prim_path}> for {arc_type:?} arc at {site}")]
	InvalidPrimPath {
		root_site: Site,
		site: Site,
		prim_path: sdf::Path,
		arc_type: ArcType,
		source_layer: String,
	},

	/// An asset path could not be opened as a layer.
	#[error("could not open layer @{asset_path}@ for {arc_type:?} arc at {site}")]
	InvalidAssetPath {
		root_site: Site,
		site: Site,
		target_path: sdf::Path,
		asset_path: String,
		resolved_asset_path: String,
		arc_type: ArcType,
		source_layer: String,
	},

	/// A reference or payload carried a non-invertible layer offset.
	#[error("invalid layer offset for {arc_type:?} arc to @{asset_path}@<{target_path}>")]
	InvalidReferenceOffset {
		root_site: Site,
		source_layer: String,
		source_path: sdf::Path,
		asset_path: String,
		target_path: sdf::Path,
		offset: sdf::Retiming,
		arc_type: ArcType,
	},

	/// An asset path targets a muted layer.
	#[error("layer @{asset_path}@ is muted; ignoring {arc_type:?} arc at {site}")]
	MutedAssetPath {
		root_site: Site,
		site: Site,
		target_path: sdf::Path,
		asset_path: String,
		resolved_asset_path: String,
		arc_type: ArcType,
		source_layer: String,
	},

	/// A reference or payload had no target prim: either no default prim
	/// was available, or no prim spec exists at the target path.
	#[error("unresolved target path <{unresolved_path}> for {arc_type:?} arc at {site}")]
	UnresolvedPrimPath {
		root_site: Site,
		site: Site,
		target_layer: String,
		unresolved_path: sdf::Path,
		source_layer: String,
		arc_type: ArcType,
	},

	/// Opinions were authored at the source of a relocation; they are
	/// ignored (the salted earth policy).
	#[error("opinion at relocation source <{path}> in layer @{layer}@")]
	OpinionAtRelocationSource {
		root_site: Site,
		layer: String,
		path: sdf::Path,
	},

	/// A site stronger than a private site authored opinions; they are
	/// ignored.
	#[error("permission denied: {site} overrides private site {private_site}")]
	PrimPermissionDenied {
		root_site: Site,
		site: Site,
		private_site: Site,
	},

	/// The prim index graph ran out of node capacity.
	#[error("prim index capacity exceeded at {root_site}")]
	IndexCapacityExceeded { root_site: Site },

	/// A node accumulated more arcs than the graph can represent.
	#[error("arc capacity exceeded at {root_site}")]
	ArcCapacityExceeded { root_site: Site },

	/// An arc was introduced at a namespace depth beyond what the graph
	/// can represent.
	#[error("arc namespace depth capacity exceeded at {root_site}")]
	ArcNamespaceDepthCapacityExceeded { root_site: Site },
}

impl Error {
	/// Capacity errors are deduplicated by kind and reported at most once
	/// per build.
	pub fn is_capacity_error(&self) -> bool {
		matches!(
			self,
			Error::IndexCapacityExceeded { .. }
				| Error::ArcCapacityExceeded { .. }
				| Error::ArcNamespaceDepthCapacityExceeded { .. }
		)
	}

	pub fn same_kind(&self, other: &Error) -> bool {
		std::mem::discriminant(self) == std::mem::discriminant(other)
	}
}
