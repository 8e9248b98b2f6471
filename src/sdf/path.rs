use crate::tf;
use std::sync::Arc;

/// A single element of a prim path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PathElement {
	Prim(tf::Token),
	VariantSelection {
		variant_set: tf::Token,
		variant: tf::Token,
	},
}

impl PathElement {
	fn write(&self, f: &mut std::fmt::Formatter, after_variant: bool) -> std::fmt::Result {
		match self {
			PathElement::Prim(name) => {
				if after_variant {
					write!(f, "{name}")
				} else {
					write!(f, "/{name}")
				}
			}
			PathElement::VariantSelection {
				variant_set,
				variant,
			} => write!(f, "{{{variant_set}={variant}}}"),
		}
	}
}

/// A path value used to locate objects in layers or scenegraphs.
///
/// Paths are absolute, immutable and cheap to clone. A path is a sequence
/// of prim elements, optionally interleaved with variant selection
/// elements (`/Model{shading=red}/Child`). Variant selection elements
/// address alternate sections of layer storage; they do not introduce new
/// levels of namespace (see [`Self::non_variant_element_count`]).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Path {
	// `None` is the empty path; `Some` with no elements is the absolute root.
	parts: Option<Arc<Vec<PathElement>>>,
}

impl Path {
	/// The empty path value.
	pub const fn empty_path() -> Self {
		Self { parts: None }
	}

	/// The absolute path representing the top of the namespace hierarchy.
	pub fn absolute_root_path() -> Self {
		Self {
			parts: Some(Arc::new(Vec::new())),
		}
	}

	fn from_elements(elements: Vec<PathElement>) -> Self {
		Self {
			parts: Some(Arc::new(elements)),
		}
	}

	fn elements(&self) -> &[PathElement] {
		match &self.parts {
			Some(parts) => parts,
			None => &[],
		}
	}
}

/// Querying paths.
impl Path {
	/// Returns true if this path is the [`Self::empty_path`].
	pub fn is_empty(&self) -> bool {
		self.parts.is_none()
	}

	/// Returns true if this path is the [`Self::absolute_root_path`].
	pub fn is_absolute_root(&self) -> bool {
		matches!(&self.parts, Some(parts) if parts.is_empty())
	}

	/// Returns the number of path elements, counting variant selections.
	pub fn element_count(&self) -> usize {
		self.elements().len()
	}

	/// Returns the number of prim elements, not counting variant selections.
	///
	/// Variant selections are represented as path components but do not
	/// represent additional levels of namespace, just alternate storage
	/// locations for data.
	pub fn non_variant_element_count(&self) -> usize {
		self.elements()
			.iter()
			.filter(|e| matches!(e, PathElement::Prim(_)))
			.count()
	}

	/// Returns whether the path identifies a prim.
	pub fn is_prim_path(&self) -> bool {
		matches!(self.elements().last(), Some(PathElement::Prim(_)))
	}

	/// Returns whether the path identifies a variant selection of a prim.
	pub fn is_prim_variant_selection_path(&self) -> bool {
		matches!(
			self.elements().last(),
			Some(PathElement::VariantSelection { .. })
		)
	}

	/// Returns whether the path is the absolute root or identifies a prim.
	pub fn is_absolute_root_or_prim_path(&self) -> bool {
		self.is_absolute_root() || self.is_prim_path()
	}

	/// Returns whether the path identifies a prim directly under the root.
	pub fn is_root_prim_path(&self) -> bool {
		self.element_count() == 1 && self.is_prim_path()
	}

	/// Returns whether any element of this path is a variant selection.
	pub fn contains_prim_variant_selection(&self) -> bool {
		self.elements()
			.iter()
			.any(|e| matches!(e, PathElement::VariantSelection { .. }))
	}

	/// Returns the variant selection of this path if it is a variant
	/// selection path.
	pub fn variant_selection(&self) -> Option<(&tf::Token, &tf::Token)> {
		match self.elements().last() {
			Some(PathElement::VariantSelection {
				variant_set,
				variant,
			}) => Some((variant_set, variant)),
			_ => None,
		}
	}

	/// Returns the name of the prim identified by the path, or the
	/// `{set=variant}` element string for a variant selection path.
	pub fn name(&self) -> String {
		match self.elements().last() {
			Some(PathElement::Prim(name)) => name.to_string(),
			Some(PathElement::VariantSelection {
				variant_set,
				variant,
			}) => format!("{{{variant_set}={variant}}}"),
			None => String::new(),
		}
	}

	/// Returns the name of the prim identified by the path as a token.
	pub fn name_token(&self) -> tf::Token {
		match self.elements().last() {
			Some(PathElement::Prim(name)) => name.clone(),
			_ => tf::Token::empty(),
		}
	}

	/// Return the path that identifies this path's namespace parent.
	///
	/// The parent of a root prim path is the absolute root; the parent of
	/// the absolute root (and of the empty path) is the empty path.
	pub fn parent_path(&self) -> Self {
		match &self.parts {
			None => Self::empty_path(),
			Some(parts) if parts.is_empty() => Self::empty_path(),
			Some(parts) => Self::from_elements(parts[..parts.len() - 1].to_vec()),
		}
	}

	/// Return a range for iterating over the ancestors of this path.
	///
	/// The range provides iteration over the prefixes of a path, ordered
	/// from longest to shortest. Starting with the path itself and ending
	/// with a single element path, not including the empty/root path.
	pub fn ancestors_range(&self) -> PathAncestorsRange {
		PathAncestorsRange { path: self.clone() }
	}

	/// Returns true if `prefix` is a prefix of this path or equal to it.
	///
	/// The absolute root path is a prefix of every non-empty path.
	pub fn has_prefix(&self, prefix: &Path) -> bool {
		if self.is_empty() || prefix.is_empty() {
			return false;
		}
		self.elements().starts_with(prefix.elements())
	}
}

/// Creating new paths by modifying existing paths.
impl Path {
	/// Creates a path by appending an element for `child_name` to this path.
	pub fn append_child(&self, child_name: &tf::Token) -> Self {
		match &self.parts {
			None => Self::empty_path(),
			Some(parts) => {
				let mut elements = parts.as_ref().clone();
				elements.push(PathElement::Prim(child_name.clone()));
				Self::from_elements(elements)
			}
		}
	}

	/// Creates a path by appending an element for `variant_set` and
	/// `variant` to this path. This path must be a prim path.
	pub fn append_variant_selection(&self, variant_set: &str, variant: &str) -> Self {
		match &self.parts {
			None => Self::empty_path(),
			Some(parts) => {
				let mut elements = parts.as_ref().clone();
				elements.push(PathElement::VariantSelection {
					variant_set: tf::Token::new(variant_set),
					variant: tf::Token::new(variant),
				});
				Self::from_elements(elements)
			}
		}
	}

	/// Returns a path with all occurrences of the prefix `old_prefix`
	/// replaced with `new_prefix`. Returns the path unchanged if it does
	/// not have `old_prefix` as a prefix.
	pub fn replace_prefix(&self, old_prefix: &Path, new_prefix: &Path) -> Self {
		if !self.has_prefix(old_prefix) {
			return self.clone();
		}
		if new_prefix.is_empty() {
			return Self::empty_path();
		}
		let mut elements = new_prefix.elements().to_vec();
		elements.extend_from_slice(&self.elements()[old_prefix.element_count()..]);
		Self::from_elements(elements)
	}

	/// Returns the path with all variant selection elements removed.
	pub fn strip_all_variant_selections(&self) -> Self {
		if !self.contains_prim_variant_selection() {
			return self.clone();
		}
		Self::from_elements(
			self.elements()
				.iter()
				.filter(|e| matches!(e, PathElement::Prim(_)))
				.cloned()
				.collect(),
		)
	}

	/// Returns the prim part of this path: trailing variant selection
	/// elements are removed, embedded ones are retained.
	pub fn prim_path(&self) -> Self {
		let elements = self.elements();
		let mut len = elements.len();
		while len > 0 && matches!(elements[len - 1], PathElement::VariantSelection { .. }) {
			len -= 1;
		}
		if len == elements.len() {
			return self.clone();
		}
		Self::from_elements(elements[..len].to_vec())
	}
}

impl From<&str> for Path {
	fn from(s: &str) -> Self {
		parse_path(s).unwrap_or_else(|| Self::empty_path())
	}
}

impl std::fmt::Display for Path {
	fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
		match &self.parts {
			None => Ok(()),
			Some(parts) if parts.is_empty() => write!(f, "/"),
			Some(parts) => {
				let mut after_variant = false;
				for element in parts.iter() {
					element.write(f, after_variant)?;
					after_variant = matches!(element, PathElement::VariantSelection { .. });
				}
				Ok(())
			}
		}
	}
}

fn is_valid_identifier(s: &str) -> bool {
	let mut chars = s.chars();
	match chars.next() {
		Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
		_ => return false,
	}
	chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_path(s: &str) -> Option<Path> {
	if s.is_empty() {
		return None;
	}
	if s == "/" {
		return Some(Path::absolute_root_path());
	}

	let mut rest = s.strip_prefix('/')?;
	let mut elements = Vec::new();

	while !rest.is_empty() {
		if let Some(tail) = rest.strip_prefix('{') {
			let close = tail.find('}')?;
			let (variant_set, variant) = tail[..close].split_once('=')?;
			if !is_valid_identifier(variant_set) || (!variant.is_empty() && !is_valid_identifier(variant)) {
				return None;
			}
			elements.push(PathElement::VariantSelection {
				variant_set: tf::Token::new(variant_set),
				variant: tf::Token::new(variant),
			});
			rest = &tail[close + 1..];
		} else {
			let rest_after_sep = rest.strip_prefix('/').unwrap_or(rest);
			let end = rest_after_sep
				.find(|c| c == '/' || c == '{')
				.unwrap_or(rest_after_sep.len());
			let name = &rest_after_sep[..end];
			if !is_valid_identifier(name) {
				return None;
			}
			elements.push(PathElement::Prim(tf::Token::new(name)));
			rest = &rest_after_sep[end..];
		}
	}

	Some(Path::from_elements(elements))
}

pub struct PathAncestorsRange {
	path: Path,
}

impl std::iter::Iterator for PathAncestorsRange {
	type Item = Path;

	fn next(&mut self) -> Option<Self::Item> {
		if self.path.is_empty() || self.path.is_absolute_root() {
			return None;
		}

		let current_path = self.path.clone();
		self.path = self.path.parent_path();
		if self.path.is_absolute_root() {
			self.path = Path::empty_path();
		}
		Some(current_path)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn p(s: &str) -> Path {
		Path::from(s)
	}

	fn t(s: &str) -> tf::Token {
		tf::Token::new(s)
	}

	#[test]
	fn append_child() {
		assert_eq!(p("/foo").append_child(&t("bar")), p("/foo/bar"));
		assert_eq!(
			Path::absolute_root_path().append_child(&t("foo")),
			p("/foo")
		);
		assert_eq!(Path::empty_path().append_child(&t("bar")), Path::empty_path());
	}

	#[test]
	fn parent_path() {
		assert_eq!(p("/foo").parent_path(), Path::absolute_root_path());
		assert_eq!(p("/foo/bar").parent_path(), p("/foo"));
		assert_eq!(p("/foo{v=a}").parent_path(), p("/foo"));
		assert_eq!(p("/foo{v=a}bar").parent_path(), p("/foo{v=a}"));
	}

	#[test]
	fn variant_selections() {
		let path = p("/Model{shading=red}");
		assert!(path.is_prim_variant_selection_path());
		assert!(!path.is_prim_path());
		assert_eq!(
			path.variant_selection(),
			Some((&t("shading"), &t("red")))
		);
		assert_eq!(path.strip_all_variant_selections(), p("/Model"));
		assert_eq!(path.prim_path(), p("/Model"));

		let nested = p("/Model{shading=red}Child");
		assert!(nested.is_prim_path());
		assert!(nested.contains_prim_variant_selection());
		assert_eq!(nested.strip_all_variant_selections(), p("/Model/Child"));
		assert_eq!(nested.prim_path(), nested);
		assert_eq!(nested.non_variant_element_count(), 2);
	}

	#[test]
	fn prefixes() {
		assert!(p("/a/b/c").has_prefix(&p("/a/b")));
		assert!(p("/a/b").has_prefix(&p("/a/b")));
		assert!(p("/a/b").has_prefix(&Path::absolute_root_path()));
		assert!(!p("/a/b").has_prefix(&p("/a/c")));
		assert_eq!(p("/a/b/c").replace_prefix(&p("/a"), &p("/x")), p("/x/b/c"));
		assert_eq!(p("/a/b").replace_prefix(&p("/q"), &p("/x")), p("/a/b"));
	}

	#[test]
	fn ancestors_range() {
		let path = p("/foo/bar/baz");
		let mut ancestors = path.ancestors_range();
		assert_eq!(ancestors.next(), Some(p("/foo/bar/baz")));
		assert_eq!(ancestors.next(), Some(p("/foo/bar")));
		assert_eq!(ancestors.next(), Some(p("/foo")));
		assert_eq!(ancestors.next(), None);
	}

	#[test]
	fn print_and_parse() {
		for text in ["/foo", "/foo/bar", "/Model{shading=red}", "/Model{shading=red}Child/Deep"] {
			assert_eq!(p(text).to_string(), text);
		}
		assert_eq!(Path::absolute_root_path().to_string(), "/");
		assert!(Path::from("foo").is_empty());
		assert!(Path::from("/foo..bar").is_empty());
	}
}
