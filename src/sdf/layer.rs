use crate::{sdf, tf};
use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

static LAYER_REGISTRY_LOCK: OnceLock<Mutex<HashMap<String, Arc<Layer>>>> = OnceLock::new();

fn layer_registry() -> &'static Mutex<HashMap<String, Arc<Layer>>> {
	LAYER_REGISTRY_LOCK.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The fields that can be authored on a prim spec.
#[derive(Debug, Default, Clone)]
pub struct PrimSpec {
	pub references: Option<sdf::ReferenceListOp>,
	pub payload: Option<sdf::PayloadListOp>,
	pub inherit_paths: Option<sdf::PathListOp>,
	pub specializes: Option<sdf::PathListOp>,
	pub variant_set_names: Option<sdf::StringListOp>,
	pub variant_selection: Option<sdf::VariantSelectionMap>,
	pub permission: Option<sdf::Permission>,
	pub symmetry_function: Option<tf::Token>,
	pub instanceable: Option<bool>,
	pub prim_order: Option<Vec<tf::Token>>,
	pub properties: Vec<tf::Token>,
	/// Free-form fields, composed by dynamic file formats.
	pub custom_data: IndexMap<String, String>,
}

#[derive(Debug, Default)]
struct LayerData {
	default_prim: tf::Token,
	sub_layers: Vec<String>,
	sub_layer_offsets: Vec<sdf::Retiming>,
	relocates: Vec<sdf::Relocate>,
	timecodes_per_second: Option<f64>,
	expression_variables: IndexMap<String, String>,
	prims: BTreeMap<sdf::Path, PrimSpec>,
}

/// A scene description container that can combine with other such containers
/// to form simple component assets, and successively larger aggregates.
///
/// Layer I/O and file format plugins live outside this crate; layers are
/// authored in memory and found by identifier through a global registry,
/// which stands in for asset resolution.
pub struct Layer {
	identifier: String,
	data: RwLock<LayerData>,
}

impl std::fmt::Debug for Layer {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Layer")
			.field("identifier", &self.identifier)
			.finish()
	}
}

impl Layer {
	/// Create a new empty layer and register it under `identifier`.
	/// Replaces any previously registered layer with the same identifier.
	pub fn create(identifier: impl ToString) -> Arc<Self> {
		let layer = Arc::new(Self {
			identifier: identifier.to_string(),
			data: RwLock::new(LayerData::default()),
		});

		let mut registry = layer_registry().lock().unwrap();
		registry.insert(layer.identifier.clone(), layer.clone());
		layer
	}

	/// Find a previously created layer by identifier.
	pub fn find(identifier: &str) -> Option<Arc<Self>> {
		layer_registry().lock().unwrap().get(identifier).cloned()
	}

	/// Find a layer by identifier, resolving through the registry. This is
	/// the seam where a real implementation would invoke asset resolution
	/// and a file format plugin.
	pub fn find_or_open(identifier: &str) -> Option<Arc<Self>> {
		Self::find(identifier)
	}

	pub fn identifier(&self) -> &str {
		&self.identifier
	}
}

/// Metadata
impl Layer {
	/// Return this layer's 'defaultPrim' metadata.
	pub fn default_prim(&self) -> tf::Token {
		self.data.read().unwrap().default_prim.clone()
	}

	pub fn set_default_prim(&self, name: impl ToString) {
		self.data.write().unwrap().default_prim = tf::Token::new(name.to_string());
	}

	/// Return this layer's 'defaultPrim' metadata interpreted as an
	/// absolute root prim path, or the empty path if unset or invalid.
	pub fn default_prim_as_path(&self) -> sdf::Path {
		let token = self.default_prim();
		if token.is_empty() {
			return sdf::Path::empty_path();
		}
		// Parsing validates the identifier; a malformed name yields the
		// empty path.
		sdf::Path::from(format!("/{token}").as_str())
	}

	pub fn sub_layer_paths(&self) -> Vec<String> {
		self.data.read().unwrap().sub_layers.clone()
	}

	pub fn sub_layer_offsets(&self) -> Vec<sdf::Retiming> {
		self.data.read().unwrap().sub_layer_offsets.clone()
	}

	pub fn add_sub_layer(&self, identifier: impl ToString, offset: sdf::Retiming) {
		let mut data = self.data.write().unwrap();
		data.sub_layers.push(identifier.to_string());
		data.sub_layer_offsets.push(offset);
	}

	pub fn relocates(&self) -> Vec<sdf::Relocate> {
		self.data.read().unwrap().relocates.clone()
	}

	pub fn add_relocate(&self, source: sdf::Path, target: sdf::Path) {
		self.data
			.write()
			.unwrap()
			.relocates
			.push(sdf::Relocate { source, target });
	}

	/// Timecodes-per-second metadata; layers without an authored value run
	/// at the conventional 24.
	pub fn timecodes_per_second(&self) -> f64 {
		self.data.read().unwrap().timecodes_per_second.unwrap_or(24.0)
	}

	pub fn set_timecodes_per_second(&self, tcps: f64) {
		self.data.write().unwrap().timecodes_per_second = Some(tcps);
	}

	pub fn expression_variables(&self) -> IndexMap<String, String> {
		self.data.read().unwrap().expression_variables.clone()
	}

	pub fn has_expression_variables(&self) -> bool {
		!self.data.read().unwrap().expression_variables.is_empty()
	}

	pub fn set_expression_variable(&self, name: impl ToString, value: impl ToString) {
		self.data
			.write()
			.unwrap()
			.expression_variables
			.insert(name.to_string(), value.to_string());
	}
}

/// Prim specs
impl Layer {
	/// Create an empty prim spec at `path`, along with any missing
	/// ancestor specs.
	pub fn define_prim(&self, path: &sdf::Path) {
		let mut data = self.data.write().unwrap();
		for ancestor in path.ancestors_range() {
			data.prims.entry(ancestor).or_default();
		}
	}

	/// Edit the prim spec at `path`, creating it (and any missing
	/// ancestor specs) if needed.
	pub fn edit_prim(&self, path: &sdf::Path, f: impl FnOnce(&mut PrimSpec)) {
		let mut data = self.data.write().unwrap();
		for ancestor in path.ancestors_range() {
			data.prims.entry(ancestor).or_default();
		}
		f(data.prims.get_mut(path).expect("spec was just created"));
	}

	pub fn has_spec(&self, path: &sdf::Path) -> bool {
		if path.is_absolute_root() {
			return true;
		}
		self.data.read().unwrap().prims.contains_key(path)
	}

	/// Whether the named field is authored on the spec at `path`.
	pub fn has_field(&self, path: &sdf::Path, field: &tf::Token) -> bool {
		let data = self.data.read().unwrap();
		let Some(spec) = data.prims.get(path) else {
			return false;
		};
		let keys = &*sdf::FIELD_KEYS;
		if field == &keys.references {
			spec.references.is_some()
		} else if field == &keys.payload {
			spec.payload.is_some()
		} else if field == &keys.inherit_paths {
			spec.inherit_paths.is_some()
		} else if field == &keys.specializes {
			spec.specializes.is_some()
		} else if field == &keys.variant_set_names {
			spec.variant_set_names.is_some()
		} else if field == &keys.variant_selection {
			spec.variant_selection.is_some()
		} else if field == &keys.permission {
			spec.permission.is_some()
		} else if field == &keys.symmetry_function {
			spec.symmetry_function.is_some()
		} else if field == &keys.prim_order {
			spec.prim_order.is_some()
		} else {
			spec.custom_data.contains_key(field.as_str())
		}
	}

	pub fn prim_spec(&self, path: &sdf::Path) -> Option<PrimSpec> {
		self.data.read().unwrap().prims.get(path).cloned()
	}

	/// The names of the prim children authored under `path`, in spec order,
	/// reordered by the prim-order field when authored.
	pub fn child_names(&self, path: &sdf::Path) -> Vec<tf::Token> {
		let data = self.data.read().unwrap();
		let mut names = Vec::new();
		for child_path in data.prims.keys() {
			if child_path.parent_path() == *path && child_path.is_prim_path() {
				let name = child_path.name_token();
				if !names.contains(&name) {
					names.push(name);
				}
			}
		}

		if let Some(spec) = data.prims.get(path)
			&& let Some(order) = &spec.prim_order
		{
			let order_op = sdf::TokenListOp {
				ordered_items: order.clone(),
				..Default::default()
			};
			names = order_op.apply_operations(names);
		}
		names
	}

	/// The options authored for a variant set at `path`: the variant names
	/// of every `path{set=...}` spec in this layer.
	pub fn variant_set_options(&self, path: &sdf::Path, variant_set: &str) -> Vec<String> {
		let data = self.data.read().unwrap();
		let mut options = Vec::new();
		for spec_path in data.prims.keys() {
			if spec_path.parent_path() == *path
				&& let Some((set, variant)) = spec_path.variant_selection()
				&& set.as_str() == variant_set
				&& !options.contains(&variant.to_string())
			{
				options.push(variant.to_string());
			}
		}
		options
	}
}
