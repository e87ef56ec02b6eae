use std::sync::Arc;

use pim_rs::build::{build, build_with_config, BuildConfig, DEFAULT_MODULE_KEY};
use pim_rs::ir::{Callee, Expr, Function, Module, TensorSpec, Var};
use pim_rs::op::{self, contrib::pim::register_external_op_helper};
use pim_rs::runtime::{load_module_from_bytes, RuntimeError, Tensor};
use pim_rs_backend_c::register_pim_codegen;
use pim_rs_backend_json::register_examplejson_backend;

fn spec22() -> TensorSpec {
    TensorSpec::f32(vec![2, 2])
}

fn t22(values: [f32; 4]) -> Tensor {
    Tensor::from_values(vec![2, 2], values.to_vec()).expect("tensor")
}

fn external_binary(op_name: &str, compiler: &str, symbol: &str) -> Arc<Function> {
    let x = Var::new(format!("x_{symbol}"), spec22());
    let y = Var::new(format!("y_{symbol}"), spec22());
    let body = match op_name {
        "add" => op::add(Expr::Var(x.clone()), Expr::Var(y.clone())),
        "subtract" => op::subtract(Expr::Var(x.clone()), Expr::Var(y.clone())),
        "multiply" => op::multiply(Expr::Var(x.clone()), Expr::Var(y.clone())),
        other => panic!("unexpected op {other}"),
    };
    Arc::new(Function::new(vec![x, y], body).set_external(compiler, symbol))
}

// Hand-attributed subgraphs calling each other, the pre-partitioned shape the
// framework must accept as-is.
#[test]
fn build_accepts_hand_partitioned_function_values() {
    register_pim_codegen();

    let x = Expr::var("x", spec22());
    let y = Expr::var("y", spec22());

    let mul = external_binary("multiply", "pim", "pim_2");
    let call_mul = Expr::call(Callee::Function(mul), vec![y.clone(), y.clone()]);

    let add = external_binary("add", "pim", "pim_1");
    let call_add = Expr::call(Callee::Function(add), vec![x.clone(), x.clone()]);

    let sub = external_binary("subtract", "pim", "pim_0");
    let call_sub = Expr::call(Callee::Function(sub), vec![call_mul, call_add]);

    let module = Module::from_expr(call_sub);
    let artifact = build(module).expect("build");

    let keys = artifact.keys();
    for key in [DEFAULT_MODULE_KEY, "pim_0", "pim_1", "pim_2"] {
        assert!(keys.iter().any(|k| k == key), "missing module key {key}");
    }

    let c_module = artifact.module("pim_0").expect("pim_0 module");
    assert_eq!(c_module.type_key(), "c");
    let source = c_module.source("c").expect("C source");
    assert!(source.contains("CSOURCE_BINARY_OP_2D"));
    assert!(source.contains("void pim_0"));

    // C source modules are not executable without a native build step, so
    // driving the graph end-to-end reports the missing external.
    let entry = artifact.entry_function().expect("entry function");
    let err = entry(&[t22([1.0; 4]), t22([2.0; 4])]).unwrap_err();
    assert!(matches!(err, RuntimeError::MissingExternal(_)));
}

#[test]
fn build_partitions_and_runs_through_examplejson() -> anyhow::Result<()> {
    register_examplejson_backend();
    for name in ["add", "subtract", "multiply"] {
        register_external_op_helper(name, "examplejson")?;
    }

    let x = Expr::var("x", spec22());
    let y = Expr::var("y", spec22());
    let expr = op::subtract(
        op::multiply(y.clone(), y.clone()),
        op::add(x.clone(), x.clone()),
    );
    let module = Module::from_expr(expr);

    let config = BuildConfig {
        partition: true,
        targets: Some(vec!["examplejson".to_string()]),
    };
    let artifact = build_with_config(module, &config)?;
    assert!(artifact.keys().iter().any(|k| k == "examplejson_0"));

    // Entry parameters follow free-variable order: y first, then x.
    let y_t = t22([1.0, 2.0, 3.0, 4.0]);
    let x_t = t22([10.0, 20.0, 30.0, 40.0]);
    let entry = artifact.entry_function().expect("entry function");
    let out = entry(&[y_t.clone(), x_t.clone()])?;
    assert_eq!(out.values(), &[-19.0, -36.0, -51.0, -64.0]);

    // The offloaded module round-trips through its registered binary loader.
    let json_module = artifact.module("examplejson_0").expect("module");
    assert_eq!(json_module.type_key(), "examplejson");
    let bytes = json_module.save_to_bytes()?;
    let reloaded = load_module_from_bytes("examplejson", &bytes)?;
    let packed = reloaded
        .get_function("examplejson_0")
        .expect("reloaded symbol");
    let out2 = packed(&[y_t, x_t])?;
    assert_eq!(out2.values(), out.values());
    Ok(())
}

#[test]
fn build_without_partitioning_stays_on_the_host() {
    let x = Expr::var("x", spec22());
    let y = Expr::var("y", spec22());
    let module = Module::from_expr(op::maximum(x, y));

    let config = BuildConfig {
        partition: false,
        targets: None,
    };
    let artifact = build_with_config(module, &config).expect("build");
    assert_eq!(artifact.keys(), vec![DEFAULT_MODULE_KEY.to_string()]);

    let host = artifact.module(DEFAULT_MODULE_KEY).expect("host module");
    assert_eq!(host.type_key(), "host");
    assert!(host.source("text").expect("ir text").contains("fn @main"));

    let entry = artifact.entry_function().expect("entry function");
    let out = entry(&[t22([1.0, 5.0, 2.0, 8.0]), t22([4.0, 3.0, 2.0, 9.0])]).expect("run");
    assert_eq!(out.values(), &[4.0, 5.0, 2.0, 9.0]);
}

#[test]
fn build_fails_when_a_claimed_compiler_has_no_codegen() {
    // Support declared, codegen never registered: the partitioner claims the
    // call but the build cannot honor it.
    register_external_op_helper("minimum", "ghost").expect("builtin op");

    let x = Expr::var("x", spec22());
    let y = Expr::var("y", spec22());
    let module = Module::from_expr(op::minimum(x, y));

    let config = BuildConfig {
        partition: true,
        targets: Some(vec!["ghost".to_string()]),
    };
    let err = build_with_config(module, &config).unwrap_err();
    assert!(matches!(
        err,
        pim_rs::build::BuildError::MissingCodegen(compiler) if compiler == "ghost"
    ));
}

#[test]
fn build_rejects_ill_typed_modules() {
    let x = Expr::var("x", TensorSpec::f32(vec![2, 2]));
    let y = Expr::var("y", TensorSpec::f32(vec![3]));
    let module = Module::from_expr(op::add(x, y));
    assert!(build(module).is_err());
}
