use crate::declare_public_tokens;

declare_public_tokens!(FieldKeys, FIELD_KEYS, [
	default_prim: "defaultPrim",
	expression_variables: "expressionVariables",
	inherit_paths: "inheritPaths",
	layer_relocates: "layerRelocates",
	payload: "payload",
	permission: "permission",
	prim_order: "primOrder",
	references: "references",
	specializes: "specializes",
	sub_layer_offsets: "subLayerOffsets",
	sub_layers: "subLayers",
	symmetry_function: "symmetryFunction",
	timecodes_per_second: "timeCodesPerSecond",
	variant_selection: "variantSelection",
	variant_set_names: "variantSetNames"
]);
