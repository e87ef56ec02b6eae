use pim_rs::build::{build_with_config, BuildConfig};
use pim_rs::ir::{Expr, Module, TensorSpec};
use pim_rs::op;
use pim_rs::runtime::Tensor;

#[test]
fn tutorial_add_constructs_a_call_expression() {
    let x = Expr::var("x", TensorSpec::f32(vec![2, 2]));
    let call = op::tutorial_add(x, 1.0);
    assert!(matches!(call, Expr::Call(_)));
}

#[test]
fn tutorial_add_runs_on_the_host_executor() {
    let x = Expr::var("x", TensorSpec::f32(vec![4]));
    let module = Module::from_expr(op::tutorial_add(x, 1.0));

    let config = BuildConfig {
        partition: false,
        targets: None,
    };
    let artifact = build_with_config(module, &config).expect("build");
    let entry = artifact.entry_function().expect("entry function");
    let input = Tensor::from_values(vec![4], vec![0.0, 0.5, -1.0, 7.0]).expect("tensor");
    let out = entry(&[input]).expect("run");
    assert_eq!(out.values(), &[1.0, 1.5, 0.0, 8.0]);
}
