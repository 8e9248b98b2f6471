use super::layer_stack::LayerStack;
use crate::{sdf, tf};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Where a composed reference or payload arc was authored: the layer, that
/// layer's cumulative offset within its stack, and the asset path exactly
/// as authored (before expression evaluation).
#[derive(Debug, Clone)]
pub struct SourceArcInfo {
	pub layer: Arc<sdf::Layer>,
	pub layer_stack_offset: sdf::Retiming,
	pub authored_asset_path: String,
}

/// Reference and payload arcs compose identically; this trait lets one
/// routine serve both.
pub trait RefOrPayload: Clone + PartialEq {
	const ARC_TYPE: super::ArcType;
	fn list_op(spec: &sdf::PrimSpec) -> Option<&sdf::ListOp<Self>>;
	fn asset_path(&self) -> &str;
	fn set_asset_path(&mut self, asset_path: String);
	fn prim_path(&self) -> &sdf::Path;
	fn layer_offset(&self) -> sdf::Retiming;
}

impl RefOrPayload for sdf::Reference {
	const ARC_TYPE: super::ArcType = super::ArcType::Reference;

	fn list_op(spec: &sdf::PrimSpec) -> Option<&sdf::ListOp<Self>> {
		spec.references.as_ref()
	}

	fn asset_path(&self) -> &str {
		&self.asset_path
	}

	fn set_asset_path(&mut self, asset_path: String) {
		self.asset_path = asset_path;
	}

	fn prim_path(&self) -> &sdf::Path {
		&self.prim_path
	}

	fn layer_offset(&self) -> sdf::Retiming {
		self.layer_offset
	}
}

impl RefOrPayload for sdf::Payload {
	const ARC_TYPE: super::ArcType = super::ArcType::Payload;

	fn list_op(spec: &sdf::PrimSpec) -> Option<&sdf::ListOp<Self>> {
		spec.payload.as_ref()
	}

	fn asset_path(&self) -> &str {
		&self.asset_path
	}

	fn set_asset_path(&mut self, asset_path: String) {
		self.asset_path = asset_path;
	}

	fn prim_path(&self) -> &sdf::Path {
		&self.prim_path
	}

	fn layer_offset(&self) -> sdf::Retiming {
		self.layer_offset
	}
}

/// Evaluate `${var}` expression syntax against the layer stack's composed
/// expression variables, recording every variable consulted.
pub fn evaluate_expression_string(
	value: &str,
	layer_stack: &LayerStack,
	consulted: &mut Vec<String>,
) -> String {
	let Some(name) = value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) else {
		return value.to_string();
	};

	if !consulted.iter().any(|n| n == name) {
		consulted.push(name.to_string());
	}
	layer_stack
		.expression_variables()
		.variables
		.get(name)
		.cloned()
		.unwrap_or_default()
}

/// Compose the reference or payload arcs authored at a site, strongest
/// first, together with per-arc source info and the expression variables
/// consulted along the way.
pub fn compose_site_arcs<T: RefOrPayload>(
	layer_stack: &LayerStack,
	path: &sdf::Path,
) -> (Vec<T>, Vec<SourceArcInfo>, Vec<String>) {
	let mut consulted = Vec::new();
	let mut composed: Vec<(T, SourceArcInfo)> = Vec::new();

	// Apply list ops weakest first so stronger layers edit weaker results.
	let layers = layer_stack.layers();
	let offsets = layer_stack.layer_offsets();
	for (layer, stack_offset) in layers.iter().zip(offsets.iter()).rev() {
		let Some(spec) = layer.prim_spec(path) else {
			continue;
		};
		let Some(op) = T::list_op(&spec) else {
			continue;
		};

		let annotate = |item: &T| -> (T, SourceArcInfo) {
			let mut item = item.clone();
			let authored = item.asset_path().to_string();
			if !authored.is_empty() {
				item.set_asset_path(evaluate_expression_string(
					&authored,
					layer_stack,
					&mut Vec::new(),
				));
			}
			(
				item,
				SourceArcInfo {
					layer: layer.clone(),
					layer_stack_offset: *stack_offset,
					authored_asset_path: authored,
				},
			)
		};

		// Track variables consulted by any item this layer contributes.
		for item in op
			.explicit_items
			.iter()
			.chain(&op.prepended_items)
			.chain(&op.appended_items)
		{
			if !item.asset_path().is_empty() {
				evaluate_expression_string(item.asset_path(), layer_stack, &mut consulted);
			}
		}

		if op.is_explicit {
			composed = op.explicit_items.iter().map(&annotate).collect();
			continue;
		}

		composed.retain(|(item, _)| {
			!op.deleted_items.contains(item)
				&& !op.prepended_items.contains(item)
				&& !op.appended_items.contains(item)
		});
		let mut next: Vec<(T, SourceArcInfo)> =
			op.prepended_items.iter().map(&annotate).collect();
		next.append(&mut composed);
		next.extend(op.appended_items.iter().map(&annotate));
		composed = next;
	}

	let (arcs, info) = composed.into_iter().unzip();
	(arcs, info, consulted)
}

fn compose_path_list_field(
	layer_stack: &LayerStack,
	path: &sdf::Path,
	field: impl Fn(&sdf::PrimSpec) -> Option<sdf::PathListOp>,
) -> Vec<sdf::Path> {
	let mut ops = Vec::new();
	for layer in layer_stack.layers() {
		if let Some(spec) = layer.prim_spec(path)
			&& let Some(op) = field(&spec)
		{
			ops.push(op);
		}
	}
	sdf::compose_list_ops(&ops)
}

/// Compose the inherit paths authored at a site.
pub fn compose_site_inherits(layer_stack: &LayerStack, path: &sdf::Path) -> Vec<sdf::Path> {
	compose_path_list_field(layer_stack, path, |spec| spec.inherit_paths.clone())
}

/// Compose the specialize paths authored at a site.
pub fn compose_site_specializes(layer_stack: &LayerStack, path: &sdf::Path) -> Vec<sdf::Path> {
	compose_path_list_field(layer_stack, path, |spec| spec.specializes.clone())
}

/// Compose the variant set names authored at a site, in list-edited order.
pub fn compose_site_variant_sets(layer_stack: &LayerStack, path: &sdf::Path) -> Vec<String> {
	let mut ops = Vec::new();
	for layer in layer_stack.layers() {
		if let Some(spec) = layer.prim_spec(path)
			&& let Some(op) = spec.variant_set_names
		{
			ops.push(op);
		}
	}
	sdf::compose_list_ops(&ops)
}

/// Compose the allowed options for one variant set at a site.
pub fn compose_site_variant_set_options(
	layer_stack: &LayerStack,
	path: &sdf::Path,
	vset: &str,
) -> BTreeSet<String> {
	let mut options = BTreeSet::new();
	for layer in layer_stack.layers() {
		options.extend(layer.variant_set_options(path, vset));
	}
	options
}

/// Compose the authored selection for one variant set at a site. An
/// authored empty selection counts as authored; it explicitly selects no
/// variant.
pub fn compose_site_variant_selection(
	layer_stack: &LayerStack,
	path: &sdf::Path,
	vset: &str,
	consulted: &mut Vec<String>,
) -> Option<String> {
	for layer in layer_stack.layers() {
		if let Some(spec) = layer.prim_spec(path)
			&& let Some(selections) = &spec.variant_selection
			&& let Some(selection) = selections.get(vset)
		{
			return Some(evaluate_expression_string(selection, layer_stack, consulted));
		}
	}
	None
}

/// Returns true if any layer in the stack has a prim spec at the site.
pub fn compose_site_has_prim_specs(layer_stack: &LayerStack, path: &sdf::Path) -> bool {
	layer_stack.layers().iter().any(|layer| layer.has_spec(path))
}

/// The strongest authored permission opinion at a site.
pub fn compose_site_permission(layer_stack: &LayerStack, path: &sdf::Path) -> sdf::Permission {
	for layer in layer_stack.layers() {
		if let Some(spec) = layer.prim_spec(path)
			&& let Some(permission) = spec.permission
		{
			return permission;
		}
	}
	sdf::Permission::Public
}

/// Returns true if symmetry information is authored at a site.
pub fn compose_site_has_symmetry(layer_stack: &LayerStack, path: &sdf::Path) -> bool {
	for layer in layer_stack.layers() {
		if let Some(spec) = layer.prim_spec(path)
			&& let Some(symmetry) = &spec.symmetry_function
		{
			return !symmetry.is_empty();
		}
	}
	false
}

/// The strongest authored instanceable opinion at a site.
pub fn compose_site_instanceable(layer_stack: &LayerStack, path: &sdf::Path) -> Option<bool> {
	for layer in layer_stack.layers() {
		if let Some(spec) = layer.prim_spec(path)
			&& let Some(instanceable) = spec.instanceable
		{
			return Some(instanceable);
		}
	}
	None
}

/// Every (layer, path) pair in the stack holding a prim spec for the site,
/// strongest first.
pub fn compose_site_prim_sites(
	layer_stack: &LayerStack,
	path: &sdf::Path,
) -> Vec<(Arc<sdf::Layer>, sdf::Path)> {
	layer_stack
		.layers()
		.iter()
		.filter(|layer| !path.is_absolute_root() && layer.has_spec(path))
		.map(|layer| (layer.clone(), path.clone()))
		.collect()
}

/// The strongest authored value of a custom field at a site. Dynamic file
/// formats compose these to build their arguments.
pub fn compose_site_custom_field(
	layer_stack: &LayerStack,
	path: &sdf::Path,
	field: &str,
) -> Option<String> {
	for layer in layer_stack.layers() {
		if let Some(spec) = layer.prim_spec(path)
			&& let Some(value) = spec.custom_data.get(field)
		{
			return Some(value.clone());
		}
	}
	None
}

/// Merge the prim child names authored at a site into `name_order` and
/// `name_set`, weakest layer first so stronger layers edit the result, and
/// apply each layer's authored order.
pub fn compose_site_child_names(
	layer_stack: &LayerStack,
	path: &sdf::Path,
	name_order: &mut Vec<tf::Token>,
	name_set: &mut BTreeSet<tf::Token>,
) {
	for layer in layer_stack.layers().iter().rev() {
		for name in layer.child_names(path) {
			if name_set.insert(name.clone()) {
				name_order.push(name);
			}
		}

		if let Some(spec) = layer.prim_spec(path)
			&& let Some(order) = spec.prim_order
		{
			let order_op = sdf::TokenListOp {
				ordered_items: order,
				..Default::default()
			};
			*name_order = order_op.apply_operations(std::mem::take(name_order));
		}
	}
}

/// Merge the property names authored at a site into `name_order` and
/// `name_set`, weakest layer first.
pub fn compose_site_property_names(
	layer_stack: &LayerStack,
	path: &sdf::Path,
	name_order: &mut Vec<tf::Token>,
	name_set: &mut BTreeSet<tf::Token>,
) {
	for layer in layer_stack.layers().iter().rev() {
		if let Some(spec) = layer.prim_spec(path) {
			for name in spec.properties {
				if name_set.insert(name.clone()) {
					name_order.push(name);
				}
			}
		}
	}
}
