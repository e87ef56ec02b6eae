use pim_rs::ir::{infer_module, Callee, Expr, Module, TensorSpec};
use pim_rs::op::{self, contrib::pim::register_pim_ops};
use pim_rs::partition::{annotate_target, partition_graph, partition_module, TargetMap};

fn spec22() -> TensorSpec {
    TensorSpec::f32(vec![2, 2])
}

#[test]
fn fully_supported_tree_becomes_one_region() {
    register_pim_ops();

    let x = Expr::var("x", spec22());
    let y = Expr::var("y", spec22());
    let expr = op::subtract(
        op::multiply(y.clone(), y.clone()),
        op::add(x.clone(), x.clone()),
    );
    let module = Module::from_expr(expr);

    let partitioned = partition_module(&module, &["pim".to_string()]).expect("partition");
    let externals: Vec<_> = partitioned.external_functions().collect();
    assert_eq!(externals.len(), 1);
    let (symbol, function) = externals[0];
    assert_eq!(symbol, "pim_0");
    assert_eq!(function.attrs.compiler.as_deref(), Some("pim"));
    assert_eq!(function.attrs.global_symbol.as_deref(), Some("pim_0"));
    // Inputs deduplicate: y and x each feed the region once.
    assert_eq!(function.params.len(), 2);

    let main = partitioned.entry_function().expect("main");
    let call = main.body.as_call().expect("call to the region");
    assert!(matches!(&call.callee, Callee::Global(g) if &*g.name == "pim_0"));

    infer_module(&partitioned).expect("partitioned module still type-checks");
}

#[test]
fn unsupported_op_splits_regions() {
    register_pim_ops();

    let x = Expr::var("x", spec22());
    let y = Expr::var("y", spec22());
    // divide carries no target.pim attribute, so it stays on the host path
    // and the two supported subtrees become separate regions.
    let expr = op::divide(
        op::multiply(x.clone(), y.clone()),
        op::add(x.clone(), y.clone()),
    );
    let module = Module::from_expr(expr);

    let partitioned = partition_module(&module, &["pim".to_string()]).expect("partition");
    let symbols: Vec<_> = partitioned
        .external_functions()
        .map(|(name, _)| name.to_string())
        .collect();
    assert_eq!(symbols, vec!["pim_0", "pim_1"]);

    let main = partitioned.entry_function().expect("main");
    let call = main.body.as_call().expect("divide call");
    assert!(matches!(&call.callee, Callee::Op(op) if op.name() == "divide"));
    for arg in &call.args {
        let inner = arg.as_call().expect("region call");
        assert!(matches!(&inner.callee, Callee::Global(_)));
    }

    infer_module(&partitioned).expect("partitioned module still type-checks");
}

#[test]
fn unclaimed_module_is_left_alone() {
    register_pim_ops();

    let x = Expr::var("x", spec22());
    let y = Expr::var("y", spec22());
    let module = Module::from_expr(op::divide(x, y));

    let partitioned = partition_module(&module, &["pim".to_string()]).expect("partition");
    assert_eq!(partitioned, module);
}

#[test]
fn annotation_reports_claimed_calls() {
    register_pim_ops();

    let x = Expr::var("x", spec22());
    let y = Expr::var("y", spec22());
    let module = Module::from_expr(op::divide(op::add(x.clone(), y.clone()), y));

    let mut targets = TargetMap::default();
    annotate_target(&module, "pim", &mut targets);
    // add is claimed, divide is not.
    assert_eq!(targets.assigned("main"), 1);
    assert_eq!(targets.compiler_for("main", 0), Some("pim"));
    assert_eq!(targets.compiler_for("main", 1), None);

    let partitioned = partition_graph(&module, &targets).expect("partition");
    assert_eq!(partitioned.external_functions().count(), 1);
}

#[test]
fn host_expressions_feeding_a_region_become_parameters() {
    register_pim_ops();

    let x = Expr::var("x", spec22());
    let y = Expr::var("y", spec22());
    // The tutorial op is not offloadable, so its result is wired into the
    // region as a fresh parameter.
    let expr = op::multiply(op::tutorial_add(x.clone(), 1.0), y.clone());
    let module = Module::from_expr(expr);

    let partitioned = partition_module(&module, &["pim".to_string()]).expect("partition");
    let (_, region) = partitioned
        .external_functions()
        .next()
        .expect("one region");
    assert_eq!(region.params.len(), 2);
    assert!(region.params.iter().any(|p| p.name.starts_with("arg")));

    let main = partitioned.entry_function().expect("main");
    let call = main.body.as_call().expect("region call");
    assert!(matches!(&call.callee, Callee::Global(_)));
    // The host argument keeps the tutorial_add computation.
    let first_arg = call.args[0].as_call().expect("host call");
    assert!(matches!(&first_arg.callee, Callee::Op(op) if op.name() == "tutorial_add"));

    infer_module(&partitioned).expect("partitioned module still type-checks");
}
