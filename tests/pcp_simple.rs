use opencomp::pcp::{self, ArcType, Error, PayloadState, PrimIndexInputs};
use opencomp::sdf;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};

fn p(s: &str) -> sdf::Path {
	sdf::Path::from(s)
}

fn compute(
	path: &str,
	stack: &Arc<pcp::LayerStack>,
	inputs: &PrimIndexInputs,
) -> pcp::PrimIndexOutputs {
	pcp::compute_prim_index(&p(path), stack.clone(), inputs)
}

// Every root-to-leaf path must visit each (layer stack, path) site at most
// once, variant arcs excepted.
fn assert_no_duplicate_sites_on_paths(graph: &pcp::PrimIndexGraph) {
	for index in graph.node_range_strong_to_weak() {
		if graph.children(index).len() > 0 {
			continue;
		}
		let mut seen: Vec<pcp::Site> = Vec::new();
		let mut current = index;
		loop {
			let node = graph.node(current);
			if node.arc_type != ArcType::Variant {
				let site = node.site();
				assert!(
					!seen.contains(&site),
					"site {site} appears twice on a root-to-leaf path"
				);
				seen.push(site);
			}
			if node.is_root_node() {
				break;
			}
			current = node.parent_index;
		}
	}
}

#[test]
fn simple_reference() {
	let m_layer = sdf::Layer::create("s1_m.usda");
	m_layer.edit_prim(&p("/M/C"), |spec| {
		spec.custom_data.insert("x".to_string(), "5".to_string());
	});

	let root_layer = sdf::Layer::create("s1_root.usda");
	root_layer.edit_prim(&p("/A"), |spec| {
		spec.references = Some(sdf::ReferenceListOp::appended(vec![sdf::Reference {
			asset_path: "s1_m.usda".to_string(),
			prim_path: p("/M"),
			..Default::default()
		}]));
	});

	let stack = pcp::LayerStack::new(root_layer);
	let outputs = compute("/A", &stack, &PrimIndexInputs::default());

	assert!(outputs.all_errors.is_empty(), "{:?}", outputs.all_errors);
	let graph = &outputs.prim_index.graph;
	assert_eq!(graph.node_count(), 2);

	let children = graph.children(0);
	assert_eq!(children.len(), 1);
	let reference = graph.node(children[0]);
	assert_eq!(reference.arc_type, ArcType::Reference);
	assert_eq!(reference.site_path, p("/M"));
	assert_eq!(reference.layer_stack.identifier(), "s1_m.usda");
	assert!(reference.has_specs());

	assert_eq!(
		outputs.prim_index.node_providing_spec(&m_layer, &p("/M")),
		Some(children[0])
	);
	assert_no_duplicate_sites_on_paths(graph);
}

#[test]
fn arc_cycle() {
	let layer = sdf::Layer::create("s2.usda");
	layer.edit_prim(&p("/A"), |spec| {
		spec.references = Some(sdf::ReferenceListOp::appended(vec![sdf::Reference {
			prim_path: p("/B"),
			..Default::default()
		}]));
	});
	layer.edit_prim(&p("/B"), |spec| {
		spec.references = Some(sdf::ReferenceListOp::appended(vec![sdf::Reference {
			prim_path: p("/A"),
			..Default::default()
		}]));
	});

	let stack = pcp::LayerStack::new(layer);
	let outputs = compute("/A", &stack, &PrimIndexInputs::default());

	// The second reference is rejected; its node is never inserted.
	assert_eq!(outputs.prim_index.graph.node_count(), 2);

	assert_eq!(outputs.all_errors.len(), 1);
	let Error::ArcCycle { cycle, .. } = &outputs.all_errors[0] else {
		panic!("expected an arc cycle error, got {:?}", outputs.all_errors[0]);
	};
	let chain: Vec<(ArcType, sdf::Path)> = cycle
		.iter()
		.map(|seg| (seg.arc_type, seg.site.path.clone()))
		.collect();
	assert_eq!(
		chain,
		vec![
			(ArcType::Root, p("/A")),
			(ArcType::Reference, p("/B")),
			(ArcType::Reference, p("/A")),
		]
	);
}

#[test]
fn variant_selection_with_fallback() {
	let layer = sdf::Layer::create("s3.usda");
	layer.edit_prim(&p("/Model"), |spec| {
		spec.variant_set_names = Some(sdf::StringListOp::appended(vec!["shading".to_string()]));
	});
	layer.define_prim(&p("/Model{shading=red}"));
	layer.define_prim(&p("/Model{shading=blue}"));

	let mut inputs = PrimIndexInputs::default();
	inputs
		.variant_fallbacks
		.insert("shading".to_string(), vec!["blue".to_string()]);

	let stack = pcp::LayerStack::new(layer);
	let outputs = compute("/Model", &stack, &inputs);

	assert!(outputs.all_errors.is_empty(), "{:?}", outputs.all_errors);
	assert_eq!(outputs.payload_state, PayloadState::NoPayload);

	let graph = &outputs.prim_index.graph;
	let variants: Vec<u16> = graph
		.node_range_strong_to_weak()
		.into_iter()
		.filter(|&n| graph.node(n).arc_type == ArcType::Variant)
		.collect();
	assert_eq!(variants.len(), 1);
	assert_eq!(
		graph.node(variants[0]).site_path,
		p("/Model{shading=blue}")
	);
	assert_eq!(
		outputs.prim_index.selection_applied_for_variant_set("shading"),
		Some("blue".to_string())
	);
}

#[test]
fn authored_variant_selection_beats_fallback() {
	let layer = sdf::Layer::create("variant_authored.usda");
	layer.edit_prim(&p("/Model"), |spec| {
		spec.variant_set_names = Some(sdf::StringListOp::appended(vec!["shading".to_string()]));
		spec.variant_selection = Some(sdf::VariantSelectionMap::from_iter([(
			"shading".to_string(),
			"red".to_string(),
		)]));
	});
	layer.define_prim(&p("/Model{shading=red}"));
	layer.define_prim(&p("/Model{shading=blue}"));

	let mut inputs = PrimIndexInputs::default();
	inputs
		.variant_fallbacks
		.insert("shading".to_string(), vec!["blue".to_string()]);

	let stack = pcp::LayerStack::new(layer);
	let outputs = compute("/Model", &stack, &inputs);

	assert_eq!(
		outputs.prim_index.selection_applied_for_variant_set("shading"),
		Some("red".to_string())
	);
	assert_eq!(
		outputs
			.prim_index
			.compose_authored_variant_selections()
			.get("shading"),
		Some(&"red".to_string())
	);
}

#[test]
fn stronger_node_wins_variant_selection() {
	// The referencing layer stack holds a stronger opinion for the
	// selection than the layer that authors the variant set.
	let m_layer = sdf::Layer::create("variant_strength_m.usda");
	m_layer.edit_prim(&p("/M"), |spec| {
		spec.variant_set_names = Some(sdf::StringListOp::appended(vec!["shading".to_string()]));
		spec.variant_selection = Some(sdf::VariantSelectionMap::from_iter([(
			"shading".to_string(),
			"red".to_string(),
		)]));
	});
	m_layer.define_prim(&p("/M{shading=red}"));
	m_layer.define_prim(&p("/M{shading=blue}"));

	let root_layer = sdf::Layer::create("variant_strength_root.usda");
	root_layer.edit_prim(&p("/A"), |spec| {
		spec.references = Some(sdf::ReferenceListOp::appended(vec![sdf::Reference {
			asset_path: "variant_strength_m.usda".to_string(),
			prim_path: p("/M"),
			..Default::default()
		}]));
		spec.variant_selection = Some(sdf::VariantSelectionMap::from_iter([(
			"shading".to_string(),
			"blue".to_string(),
		)]));
	});

	let stack = pcp::LayerStack::new(root_layer);
	let outputs = compute("/A", &stack, &PrimIndexInputs::default());

	assert!(outputs.all_errors.is_empty(), "{:?}", outputs.all_errors);
	assert_eq!(
		outputs.prim_index.selection_applied_for_variant_set("shading"),
		Some("blue".to_string())
	);
}

#[test]
fn permission_denied_reference() {
	let layer = sdf::Layer::create("s6.usda");
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
	let outputs = compute("/Pub", &stack, &PrimIndexInputs::default());

	assert_eq!(outputs.all_errors.len(), 1);
	let Error::ArcPermissionDenied { private_site, .. } = &outputs.all_errors[0] else {
		panic!("expected a permission error, got {:?}", outputs.all_errors[0]);
	};
	assert_eq!(private_site.path, p("/Priv"));

	let graph = &outputs.prim_index.graph;
	let children = graph.children(0);
	assert_eq!(children.len(), 1);
	let reference = graph.node(children[0]);
	assert!(reference.is_inert());
	assert!(!reference.can_contribute_specs());
}

fn author_payload(tag: &str) -> Arc<pcp::LayerStack> {
	let m_layer = sdf::Layer::create(format!("payload_m_{tag}.usda"));
	m_layer.define_prim(&p("/M"));

	let root_layer = sdf::Layer::create(format!("payload_root_{tag}.usda"));
	root_layer.edit_prim(&p("/A"), |spec| {
		spec.payload = Some(sdf::PayloadListOp::appended(vec![sdf::Payload {
			asset_path: format!("payload_m_{tag}.usda"),
			prim_path: p("/M"),
			..Default::default()
		}]));
	});
	pcp::LayerStack::new(root_layer)
}

#[test]
fn payload_without_include_set_never_loads() {
	let stack = author_payload("never");
	let outputs = compute("/A", &stack, &PrimIndexInputs::default());

	assert!(outputs.prim_index.has_any_payloads());
	assert_eq!(outputs.payload_state, PayloadState::NoPayload);
	assert_eq!(outputs.prim_index.graph.node_count(), 1);
}

#[test]
fn payload_gated_by_include_set() {
	let stack = author_payload("set");
	let included = RwLock::new(HashSet::new());

	let mut inputs = PrimIndexInputs::default();
	inputs.included_payloads = Some(&included);

	let outputs = compute("/A", &stack, &inputs);
	assert_eq!(outputs.payload_state, PayloadState::ExcludedByIncludeSet);
	assert_eq!(outputs.prim_index.graph.node_count(), 1);

	included.write().unwrap().insert(p("/A"));
	let outputs = compute("/A", &stack, &inputs);
	assert_eq!(outputs.payload_state, PayloadState::IncludedByIncludeSet);

	let graph = &outputs.prim_index.graph;
	assert_eq!(graph.node_count(), 2);
	assert_eq!(graph.node(1).arc_type, ArcType::Payload);
	assert_eq!(graph.node(1).site_path, p("/M"));
	assert!(outputs.prim_index.has_any_payloads());
}

#[test]
fn payload_predicate_overrides_include_set() {
	let stack = author_payload("pred");
	let included = RwLock::new(HashSet::new());
	let include_all = |_: &sdf::Path| true;

	let mut inputs = PrimIndexInputs::default();
	inputs.included_payloads = Some(&included);
	inputs.include_payload_predicate = Some(&include_all);

	let outputs = compute("/A", &stack, &inputs);
	assert_eq!(outputs.payload_state, PayloadState::IncludedByPredicate);
	assert_eq!(outputs.prim_index.graph.node_count(), 2);
}

#[test]
fn invalid_reference_target_path() {
	let layer = sdf::Layer::create("invalid_target.usda");
	layer.edit_prim(&p("/A"), |spec| {
		spec.references = Some(sdf::ReferenceListOp::appended(vec![sdf::Reference {
			prim_path: p("/M{v=x}"),
			..Default::default()
		}]));
	});

	let stack = pcp::LayerStack::new(layer);
	let outputs = compute("/A", &stack, &PrimIndexInputs::default());

	assert_eq!(outputs.prim_index.graph.node_count(), 1);
	assert!(matches!(
		outputs.all_errors.as_slice(),
		[Error::InvalidPrimPath { prim_path, .. }] if *prim_path == p("/M{v=x}")
	));
}

#[test]
fn unresolved_asset_path() {
	let layer = sdf::Layer::create("missing_asset.usda");
	layer.edit_prim(&p("/A"), |spec| {
		spec.references = Some(sdf::ReferenceListOp::appended(vec![sdf::Reference {
			asset_path: "does_not_exist.usda".to_string(),
			prim_path: p("/M"),
			..Default::default()
		}]));
	});

	let stack = pcp::LayerStack::new(layer);
	let outputs = compute("/A", &stack, &PrimIndexInputs::default());

	assert!(matches!(
		outputs.all_errors.as_slice(),
		[Error::InvalidAssetPath { asset_path, .. }] if asset_path == "does_not_exist.usda"
	));
}

#[test]
fn unresolved_default_prim_adds_placeholder() {
	// No target prim and no defaultPrim: the arc still lands as an inert
	// placeholder on the pseudo-root so later authoring invalidates it.
	sdf::Layer::create("no_default_m.usda");
	let layer = sdf::Layer::create("no_default_root.usda");
	layer.edit_prim(&p("/A"), |spec| {
		spec.references = Some(sdf::ReferenceListOp::appended(vec![sdf::Reference {
			asset_path: "no_default_m.usda".to_string(),
			..Default::default()
		}]));
	});

	let stack = pcp::LayerStack::new(layer);
	let outputs = compute("/A", &stack, &PrimIndexInputs::default());

	assert!(matches!(
		outputs.all_errors.first(),
		Some(Error::UnresolvedPrimPath { .. })
	));
	let graph = &outputs.prim_index.graph;
	assert_eq!(graph.node_count(), 2);
	assert!(graph.node(1).site_path.is_absolute_root());
	assert!(graph.node(1).is_inert());
}

#[test]
fn default_prim_resolves_reference_target() {
	let m_layer = sdf::Layer::create("default_prim_m.usda");
	m_layer.set_default_prim("M");
	m_layer.define_prim(&p("/M"));

	let layer = sdf::Layer::create("default_prim_root.usda");
	layer.edit_prim(&p("/A"), |spec| {
		spec.references = Some(sdf::ReferenceListOp::appended(vec![sdf::Reference {
			asset_path: "default_prim_m.usda".to_string(),
			..Default::default()
		}]));
	});

	let stack = pcp::LayerStack::new(layer);
	let outputs = compute("/A", &stack, &PrimIndexInputs::default());

	assert!(outputs.all_errors.is_empty(), "{:?}", outputs.all_errors);
	assert_eq!(outputs.prim_index.graph.node(1).site_path, p("/M"));
}

#[test]
fn invalid_layer_offset_is_reset() {
	let m_layer = sdf::Layer::create("offset_m.usda");
	m_layer.define_prim(&p("/M"));

	let layer = sdf::Layer::create("offset_root.usda");
	layer.edit_prim(&p("/A"), |spec| {
		spec.references = Some(sdf::ReferenceListOp::appended(vec![sdf::Reference {
			asset_path: "offset_m.usda".to_string(),
			prim_path: p("/M"),
			layer_offset: sdf::Retiming::new(f64::NAN, 1.0),
		}]));
	});

	let stack = pcp::LayerStack::new(layer);
	let outputs = compute("/A", &stack, &PrimIndexInputs::default());

	assert!(matches!(
		outputs.all_errors.as_slice(),
		[Error::InvalidReferenceOffset { .. }]
	));
	// The arc is still added, with the offset reset to identity.
	let graph = &outputs.prim_index.graph;
	assert_eq!(graph.node_count(), 2);
	assert!(graph.node(1).map_to_parent.time_offset().is_identity());
}

#[test]
fn layer_offset_scales_with_timecodes_per_second() {
	let m_layer = sdf::Layer::create("tcps_m.usda");
	m_layer.set_timecodes_per_second(48.0);
	m_layer.define_prim(&p("/M"));

	let layer = sdf::Layer::create("tcps_root.usda");
	layer.edit_prim(&p("/A"), |spec| {
		spec.references = Some(sdf::ReferenceListOp::appended(vec![sdf::Reference {
			asset_path: "tcps_m.usda".to_string(),
			prim_path: p("/M"),
			layer_offset: sdf::Retiming::new(10.0, 2.0),
		}]));
	});

	let stack = pcp::LayerStack::new(layer);
	let outputs = compute("/A", &stack, &PrimIndexInputs::default());

	assert!(outputs.all_errors.is_empty(), "{:?}", outputs.all_errors);
	let offset = outputs.prim_index.graph.node(1).map_to_parent.time_offset();
	assert_eq!(offset.offset, 10.0);
	// The authored scale of 2 halves across the 24 -> 48 tcps boundary.
	assert_eq!(offset.scale, 1.0);
}

#[test]
fn graph_snapshot_round_trip() {
	let m_layer = sdf::Layer::create("roundtrip_m.usda");
	m_layer.edit_prim(&p("/M"), |spec| {
		spec.inherit_paths = Some(sdf::PathListOp::appended(vec![p("/Class")]));
	});
	m_layer.define_prim(&p("/Class"));

	let layer = sdf::Layer::create("roundtrip_root.usda");
	layer.edit_prim(&p("/A"), |spec| {
		spec.references = Some(sdf::ReferenceListOp::appended(vec![sdf::Reference {
			asset_path: "roundtrip_m.usda".to_string(),
			prim_path: p("/M"),
			..Default::default()
		}]));
	});

	let stack = pcp::LayerStack::new(layer);
	let outputs = compute("/A", &stack, &PrimIndexInputs::default());

	let snapshot = pcp::diagnostic::dump_graph(&outputs.prim_index);
	let serialized = pcp::diagnostic::save_graph(&snapshot).unwrap();
	let loaded = pcp::diagnostic::load_graph(&serialized).unwrap();
	assert_eq!(snapshot, loaded);

	let mut dot = Vec::new();
	pcp::diagnostic::dump_dot_graph(&outputs.prim_index, &mut dot).unwrap();
	let dot = String::from_utf8(dot).unwrap();
	assert!(dot.starts_with("digraph"));
	assert!(dot.contains("reference"));
}
