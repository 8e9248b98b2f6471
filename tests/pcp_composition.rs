use opencomp::pcp::{
	self, ArcType, DynamicFileFormat, DynamicFormatContext, Error, PrimIndexCache,
	PrimIndexInputs,
};
use opencomp::sdf;
use std::collections::BTreeSet;
use std::sync::Arc;

fn p(s: &str) -> sdf::Path {
	sdf::Path::from(s)
}

fn t(s: &str) -> opencomp::tf::Token {
	opencomp::tf::Token::new(s)
}

fn compute(
	path: &str,
	stack: &Arc<pcp::LayerStack>,
	inputs: &PrimIndexInputs,
) -> pcp::PrimIndexOutputs {
	pcp::compute_prim_index(&p(path), stack.clone(), inputs)
}

fn find_node(graph: &pcp::PrimIndexGraph, arc_type: ArcType, path: &sdf::Path) -> Option<u16> {
	graph
		.node_range_strong_to_weak()
		.into_iter()
		.find(|&n| graph.node(n).arc_type == arc_type && graph.node(n).site_path == *path)
}

#[test]
fn implied_class_propagates_across_reference() {
	// /M/I inherits the sibling class /M/C. Indexing /R/I, where /R
	// references /M, must imply the inherit at /R/C in the referencing
	// namespace, with its origin pointing back at the original arc.
	let layer = sdf::Layer::create("implied_class.usda");
	layer.define_prim(&p("/M/C"));
	layer.edit_prim(&p("/M/I"), |spec| {
		spec.inherit_paths = Some(sdf::PathListOp::appended(vec![p("/M/C")]));
	});
	layer.edit_prim(&p("/R"), |spec| {
		spec.references = Some(sdf::ReferenceListOp::appended(vec![sdf::Reference {
			prim_path: p("/M"),
			..Default::default()
		}]));
	});

	let stack = pcp::LayerStack::new(layer);
	let outputs = compute("/R/I", &stack, &PrimIndexInputs::default());
	assert!(outputs.all_errors.is_empty(), "{:?}", outputs.all_errors);

	let graph = &outputs.prim_index.graph;
	let implied = find_node(graph, ArcType::Inherit, &p("/R/C"))
		.expect("implied inherit at /R/C");
	assert_eq!(graph.node(implied).parent_index, 0);

	let origin = graph.node(implied).origin_index;
	let origin_node = graph.node(origin);
	assert_eq!(origin_node.arc_type, ArcType::Inherit);
	assert_eq!(origin_node.site_path, p("/M/C"));

	// The implied inherit is stronger than the reference that carried it.
	let children = graph.children(0);
	assert_eq!(graph.node(children[0]).arc_type, ArcType::Inherit);
	assert!(
		children
			.iter()
			.any(|&c| graph.node(c).arc_type == ArcType::Reference)
	);
}

#[test]
fn specializes_subtree_propagates_to_root() {
	let m_layer = sdf::Layer::create("specializes_m.usda");
	m_layer.define_prim(&p("/Base"));
	m_layer.edit_prim(&p("/M"), |spec| {
		spec.specializes = Some(sdf::PathListOp::appended(vec![p("/Base")]));
	});

	let layer = sdf::Layer::create("specializes_root.usda");
	layer.edit_prim(&p("/A"), |spec| {
		spec.references = Some(sdf::ReferenceListOp::appended(vec![sdf::Reference {
			asset_path: "specializes_m.usda".to_string(),
			prim_path: p("/M"),
			..Default::default()
		}]));
	});

	let stack = pcp::LayerStack::new(layer);
	let outputs = compute("/A", &stack, &PrimIndexInputs::default());
	assert!(outputs.all_errors.is_empty(), "{:?}", outputs.all_errors);

	let graph = &outputs.prim_index.graph;
	let order = graph.node_range_strong_to_weak();

	// Specializes opinions order after everything else: the propagated
	// subtree hangs off the root as its weakest child.
	let last = *order.last().unwrap();
	let propagated = graph.node(last);
	assert_eq!(propagated.arc_type, ArcType::Specialize);
	assert_eq!(propagated.site_path, p("/Base"));
	assert_eq!(propagated.parent_index, 0);
	assert!(propagated.can_contribute_specs());

	// The original specializes node under the reference stays behind as
	// an inert origin.
	let original = propagated.origin_index;
	assert_ne!(original, last);
	assert_eq!(graph.node(original).site_path, p("/Base"));
	assert!(graph.node(original).is_inert());
}

#[test]
fn relocation_adds_source_node() {
	// The layer stack relocates /A/B to /A/C; opinions authored for the
	// source under a reference must surface at the target.
	let layer = sdf::Layer::create("relocates.usda");
	layer.add_relocate(p("/A/B"), p("/A/C"));
	layer.define_prim(&p("/M/B"));
	layer.edit_prim(&p("/A"), |spec| {
		spec.references = Some(sdf::ReferenceListOp::appended(vec![sdf::Reference {
			prim_path: p("/M"),
			..Default::default()
		}]));
	});

	let stack = pcp::LayerStack::new(layer);
	let outputs = compute("/A/C", &stack, &PrimIndexInputs::default());
	assert!(outputs.all_errors.is_empty(), "{:?}", outputs.all_errors);

	let graph = &outputs.prim_index.graph;
	let relocate = find_node(graph, ArcType::Relocate, &p("/A/B"))
		.expect("relocation source node at /A/B");
	let relocate_node = graph.node(relocate);

	// The relocation source node contributes no opinions of its own and
	// carries an identity mapping.
	assert!(relocate_node.is_inert());
	assert!(relocate_node.map_to_parent.is_constant_identity());

	// The referenced opinions for the source flow in beneath it.
	let reference = find_node(graph, ArcType::Reference, &p("/M/B"))
		.expect("ancestral reference at /M/B");
	assert!(graph.node(reference).can_contribute_specs());
}

#[test]
fn relocation_composes_child_names() {
	let layer = sdf::Layer::create("relocates_names.usda");
	layer.add_relocate(p("/A/B"), p("/A/C"));
	layer.define_prim(&p("/M/B"));
	layer.edit_prim(&p("/A"), |spec| {
		spec.references = Some(sdf::ReferenceListOp::appended(vec![sdf::Reference {
			prim_path: p("/M"),
			..Default::default()
		}]));
	});

	let stack = pcp::LayerStack::new(layer);
	let outputs = compute("/A", &stack, &PrimIndexInputs::default());

	let mut names = Vec::new();
	let mut prohibited = BTreeSet::new();
	outputs
		.prim_index
		.compute_prim_child_names(&mut names, &mut prohibited);

	assert_eq!(names, vec![t("C")]);
	assert!(prohibited.contains(&t("B")));
}

#[test]
fn opinion_at_relocation_source_is_an_error() {
	let layer = sdf::Layer::create("relocates_opinion.usda");
	layer.add_relocate(p("/A/B"), p("/A/C"));
	layer.define_prim(&p("/A/B"));
	layer.define_prim(&p("/M/B"));
	layer.edit_prim(&p("/A"), |spec| {
		spec.references = Some(sdf::ReferenceListOp::appended(vec![sdf::Reference {
			prim_path: p("/M"),
			..Default::default()
		}]));
	});

	let stack = pcp::LayerStack::new(layer);
	let outputs = compute("/A/C", &stack, &PrimIndexInputs::default());

	assert!(
		outputs.all_errors.iter().any(|err| matches!(
			err,
			Error::OpinionAtRelocationSource { path, .. } if *path == p("/A/B")
		)),
		"{:?}",
		outputs.all_errors
	);
}

#[test]
fn implied_relocation_reaches_grandparent() {
	let layer = sdf::Layer::create("implied_relocates.usda");
	layer.add_relocate(p("/A/B"), p("/A/C"));
	layer.define_prim(&p("/A/B"));
	layer.edit_prim(&p("/X"), |spec| {
		spec.references = Some(sdf::ReferenceListOp::appended(vec![sdf::Reference {
			prim_path: p("/A"),
			..Default::default()
		}]));
	});

	let stack = pcp::LayerStack::new(layer);
	let outputs = compute("/X/C", &stack, &PrimIndexInputs::default());

	let graph = &outputs.prim_index.graph;
	let implied = find_node(graph, ArcType::Relocate, &p("/X/B"))
		.expect("implied relocate at /X/B");
	assert_eq!(graph.node(implied).parent_index, 0);
}

#[test]
fn culling_drops_opinion_free_subtrees() {
	let m_layer = sdf::Layer::create("cull_m.usda");
	m_layer.define_prim(&p("/M"));

	let layer = sdf::Layer::create("cull_root.usda");
	layer.edit_prim(&p("/A"), |spec| {
		spec.references = Some(sdf::ReferenceListOp::appended(vec![sdf::Reference {
			asset_path: "cull_m.usda".to_string(),
			prim_path: p("/M"),
			..Default::default()
		}]));
	});

	let stack = pcp::LayerStack::new(layer);

	// /M/Child holds no specs, so the reference subtree for the child
	// prim culls away entirely.
	let outputs = compute("/A/Child", &stack, &PrimIndexInputs::default());
	assert_eq!(outputs.prim_index.graph.node_count(), 1);

	let inputs = PrimIndexInputs {
		cull: false,
		..Default::default()
	};
	let outputs = compute("/A/Child", &stack, &inputs);
	let graph = &outputs.prim_index.graph;
	assert_eq!(graph.node_count(), 2);
	assert!(!graph.node(1).has_specs());
	assert!(graph.node(1).is_due_to_ancestor());
}

#[test]
fn usd_mode_skips_permissions_and_prim_stack() {
	let layer = sdf::Layer::create("usd_mode.usda");
	layer.edit_prim(&p("/Priv"), |spec| {
		spec.permission = Some(sdf::Permission::Private);
	});
	layer.edit_prim(&p("/Pub"), |spec| {
		spec.references = Some(sdf::ReferenceListOp::appended(vec![sdf::Reference {
			prim_path: p("/Priv"),
			..Default::default()
		}]));
	});

	let stack = pcp::LayerStack::new(layer);
	let inputs = PrimIndexInputs {
		usd: true,
		..Default::default()
	};
	let outputs = compute("/Pub", &stack, &inputs);

	// Permissions are not computed in USD mode, so the arc is allowed.
	assert!(outputs.all_errors.is_empty(), "{:?}", outputs.all_errors);
	let graph = &outputs.prim_index.graph;
	assert!(graph.node(1).can_contribute_specs());

	// Prim stacks are not retained, but spec presence still composes.
	assert!(outputs.prim_index.prim_stack().is_empty());
	assert!(outputs.prim_index.has_specs());
	assert!(outputs.prim_index.is_usd());
}

#[test]
fn expression_variables_resolve_asset_paths() {
	let m_layer = sdf::Layer::create("exprvar_m.usda");
	m_layer.define_prim(&p("/M"));

	let layer = sdf::Layer::create("exprvar_root.usda");
	layer.set_expression_variable("MODEL_ASSET", "exprvar_m.usda");
	layer.edit_prim(&p("/A"), |spec| {
		spec.references = Some(sdf::ReferenceListOp::appended(vec![sdf::Reference {
			asset_path: "${MODEL_ASSET}".to_string(),
			prim_path: p("/M"),
			..Default::default()
		}]));
	});

	let stack = pcp::LayerStack::new(layer);
	let outputs = compute("/A", &stack, &PrimIndexInputs::default());

	assert!(outputs.all_errors.is_empty(), "{:?}", outputs.all_errors);
	assert_eq!(
		outputs.prim_index.graph.node(1).layer_stack.identifier(),
		"exprvar_m.usda"
	);

	assert_eq!(outputs.expression_variables_dependency.len(), 1);
	let (dep_stack, names) = &outputs.expression_variables_dependency[0];
	assert!(Arc::ptr_eq(dep_stack, &stack));
	assert_eq!(names, &vec!["MODEL_ASSET".to_string()]);
}

struct LodFormat;

impl DynamicFileFormat for LodFormat {
	fn format_name(&self) -> &str {
		"lod"
	}

	fn extension(&self) -> &str {
		"lodmodel"
	}

	fn compose_arguments(
		&self,
		_asset_path: &str,
		context: &mut DynamicFormatContext,
	) -> Option<String> {
		let level = context.compose_field_value("lodLevel")?;
		Some(format!("lod={level}"))
	}
}

#[test]
fn dynamic_file_format_dependencies_are_recorded() {
	let model_layer = sdf::Layer::create("model.lodmodel");
	model_layer.define_prim(&p("/M"));

	let layer = sdf::Layer::create("dynamic_root.usda");
	layer.edit_prim(&p("/A"), |spec| {
		spec.payload = Some(sdf::PayloadListOp::appended(vec![sdf::Payload {
			asset_path: "model.lodmodel".to_string(),
			prim_path: p("/M"),
			..Default::default()
		}]));
		spec.custom_data
			.insert("lodLevel".to_string(), "2".to_string());
	});

	let included = std::sync::RwLock::new(std::collections::HashSet::from([p("/A")]));
	let formats: [&dyn DynamicFileFormat; 1] = [&LodFormat];
	let inputs = PrimIndexInputs {
		included_payloads: Some(&included),
		dynamic_file_formats: &formats,
		..Default::default()
	};

	let stack = pcp::LayerStack::new(layer);
	let outputs = compute("/A", &stack, &inputs);

	assert!(outputs.all_errors.is_empty(), "{:?}", outputs.all_errors);
	assert_eq!(outputs.dynamic_file_format_dependency.len(), 1);
	let dependency = &outputs.dynamic_file_format_dependency[0];
	assert_eq!(dependency.file_format, "lod");
	assert_eq!(dependency.context_data.as_deref(), Some("lod=2"));
	assert_eq!(dependency.field_names, vec!["lodLevel".to_string()]);
	assert!(dependency.attribute_names.is_empty());
}

struct AncestorCache {
	stack: Arc<pcp::LayerStack>,
	parent: pcp::PrimIndex,
}

impl PrimIndexCache for AncestorCache {
	fn layer_stack(&self) -> Arc<pcp::LayerStack> {
		self.stack.clone()
	}

	fn muted_layer(&self, _asset_path: &str) -> Option<String> {
		None
	}

	fn inputs_are_equivalent_to(&self, _inputs: &PrimIndexInputs) -> bool {
		true
	}

	fn computed_prim_index(&self, path: &sdf::Path) -> Option<pcp::PrimIndex> {
		(*path == self.parent.path()).then(|| self.parent.clone())
	}
}

#[test]
fn ancestral_index_comes_from_cache() {
	let m_layer = sdf::Layer::create("cache_m.usda");
	m_layer.define_prim(&p("/M/B"));

	let layer = sdf::Layer::create("cache_root.usda");
	layer.edit_prim(&p("/A"), |spec| {
		spec.references = Some(sdf::ReferenceListOp::appended(vec![sdf::Reference {
			asset_path: "cache_m.usda".to_string(),
			prim_path: p("/M"),
			..Default::default()
		}]));
	});

	let stack = pcp::LayerStack::new(layer);
	let parent_outputs = compute("/A", &stack, &PrimIndexInputs::default());
	assert!(parent_outputs.all_errors.is_empty());

	let cache = AncestorCache {
		stack: stack.clone(),
		parent: parent_outputs.prim_index.clone(),
	};
	let inputs = PrimIndexInputs {
		cache: Some(&cache),
		..Default::default()
	};

	let outputs = compute("/A/B", &stack, &inputs);
	assert!(outputs.all_errors.is_empty(), "{:?}", outputs.all_errors);

	let graph = &outputs.prim_index.graph;
	assert_eq!(graph.root_path(), &p("/A/B"));
	let reference = find_node(graph, ArcType::Reference, &p("/M/B"))
		.expect("ancestral reference at /M/B");
	assert!(graph.node(reference).is_due_to_ancestor());
	assert!(graph.node(reference).has_specs());
}

#[test]
fn mutation_after_finalize_is_frozen() {
	let layer = sdf::Layer::create("finalized.usda");
	layer.define_prim(&p("/A"));

	let stack = pcp::LayerStack::new(layer);
	let outputs = compute("/A", &stack, &PrimIndexInputs::default());
	assert!(outputs.prim_index.graph.is_finalized());
}

#[test]
fn property_names_compose_across_arcs() {
	let m_layer = sdf::Layer::create("props_m.usda");
	m_layer.edit_prim(&p("/M"), |spec| {
		spec.properties = vec![t("radius"), t("color")];
	});

	let layer = sdf::Layer::create("props_root.usda");
	layer.edit_prim(&p("/A"), |spec| {
		spec.references = Some(sdf::ReferenceListOp::appended(vec![sdf::Reference {
			asset_path: "props_m.usda".to_string(),
			prim_path: p("/M"),
			..Default::default()
		}]));
		spec.properties = vec![t("visibility")];
	});

	let stack = pcp::LayerStack::new(layer);
	let outputs = compute("/A", &stack, &PrimIndexInputs::default());

	let mut names = Vec::new();
	outputs.prim_index.compute_prim_property_names(&mut names);
	assert_eq!(names, vec![t("radius"), t("color"), t("visibility")]);
}
