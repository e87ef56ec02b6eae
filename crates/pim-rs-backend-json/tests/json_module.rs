use pim_rs::codegen::ExternalCodegen;
use pim_rs::ir::{Expr, Function, TensorSpec, Var};
use pim_rs::op;
use pim_rs::runtime::{load_module_from_bytes, RuntimeError, RuntimeModule, Tensor};
use pim_rs_backend_json::{
    register_examplejson_backend, JsonCodegen, JsonGraphModule, EXAMPLE_JSON_TYPE_KEY,
};

const GRAPH: &str = "\
subgraph_examplejson_0
input 0 2 2
input 1 2 2
add 2 inputs: 0 1 shape: 2 2
sub 3 inputs: 2 0 shape: 2 2
";

fn t22(values: [f32; 4]) -> Tensor {
    Tensor::from_values(vec![2, 2], values.to_vec()).expect("tensor")
}

#[test]
fn parses_and_executes_a_graph() {
    let module = JsonGraphModule::new(GRAPH).expect("parse");
    assert_eq!(module.type_key(), EXAMPLE_JSON_TYPE_KEY);

    let packed = module
        .get_function("examplejson_0")
        .expect("subgraph symbol");
    let a = t22([1.0, 2.0, 3.0, 4.0]);
    let b = t22([10.0, 20.0, 30.0, 40.0]);
    // (a + b) - a == b
    let out = packed(&[a, b.clone()]).expect("run");
    assert_eq!(out.values(), b.values());
}

#[test]
fn unknown_subgraph_name_has_no_function() {
    let module = JsonGraphModule::new(GRAPH).expect("parse");
    assert!(module.get_function("examplejson_7").is_none());
}

#[test]
fn unknown_op_token_fails_at_execution() {
    let graph = "\
subgraph_examplejson_0
input 0 2
input 1 2
div 2 inputs: 0 1 shape: 2
";
    let module = JsonGraphModule::new(graph).expect("parse");
    let packed = module.get_function("examplejson_0").expect("symbol");
    let a = Tensor::from_values(vec![2], vec![1.0, 2.0]).expect("tensor");
    let err = packed(&[a.clone(), a]).unwrap_err();
    assert!(matches!(err, RuntimeError::UnknownOp(op) if op == "div"));
}

#[test]
fn input_shape_mismatch_is_reported() {
    let module = JsonGraphModule::new(GRAPH).expect("parse");
    let packed = module.get_function("examplejson_0").expect("symbol");
    let bad = Tensor::from_values(vec![4], vec![0.0; 4]).expect("tensor");
    let err = packed(&[bad, t22([0.0; 4])]).unwrap_err();
    assert!(matches!(err, RuntimeError::InputSpecMismatch { index: 0, .. }));
}

#[test]
fn binary_save_round_trips_through_the_loader_registry() {
    register_examplejson_backend();
    assert!(pim_rs::runtime::list_module_loaders()
        .iter()
        .any(|k| k == EXAMPLE_JSON_TYPE_KEY));

    let module = JsonGraphModule::new(GRAPH).expect("parse");
    let bytes = module.save_to_bytes().expect("save");
    let reloaded = load_module_from_bytes(EXAMPLE_JSON_TYPE_KEY, &bytes).expect("reload");
    assert_eq!(reloaded.type_key(), EXAMPLE_JSON_TYPE_KEY);

    let packed = reloaded.get_function("examplejson_0").expect("symbol");
    let a = t22([5.0, 5.0, 5.0, 5.0]);
    let b = t22([1.0, 2.0, 3.0, 4.0]);
    let out = packed(&[a, b.clone()]).expect("run");
    assert_eq!(out.values(), b.values());
}

#[test]
fn graph_text_loads_from_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("subgraph.txt");
    std::fs::write(&path, GRAPH).expect("write");

    let module = JsonGraphModule::from_file(&path).expect("load");
    assert_eq!(module.graph_text(), GRAPH);
    assert!(module.get_function("examplejson_0").is_some());
}

#[test]
fn codegen_lowers_a_partitioned_function() -> anyhow::Result<()> {
    let spec = TensorSpec::f32(vec![2, 2]);
    let x = Var::new("x", spec.clone());
    let y = Var::new("y", spec);
    let body = op::multiply(
        op::add(Expr::Var(x.clone()), Expr::Var(y.clone())),
        Expr::Var(y.clone()),
    );
    let function =
        Function::new(vec![x, y], body).set_external("examplejson", "examplejson_4");

    let codegen = JsonCodegen::new();
    let module = codegen.compile(&function)?;
    let packed = module.get_function("examplejson_4").expect("symbol");

    let x_t = t22([1.0, 2.0, 3.0, 4.0]);
    let y_t = t22([2.0, 2.0, 2.0, 2.0]);
    // (x + y) * y
    let out = packed(&[x_t, y_t])?;
    assert_eq!(out.values(), &[6.0, 8.0, 10.0, 12.0]);
    Ok(())
}

#[test]
fn json_source_dump_lists_nodes() {
    let module = JsonGraphModule::new(GRAPH).expect("parse");
    let dump = module.source("json").expect("json dump");
    assert!(dump.contains("\"op\": \"add\""));
    assert!(dump.contains("\"op\": \"sub\""));
    // The raw text stays retrievable as well.
    assert_eq!(module.source("text").expect("raw text"), GRAPH);
}
