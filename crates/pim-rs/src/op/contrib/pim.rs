//! Operator support declarations for the pim accelerator target.

use std::sync::{Arc, OnceLock};

use tracing::debug;

use super::super::{register_op_attr, target_key, OpAttr, OpError};

/// Compiler identifier the pim codegen registers under.
pub const PIM_COMPILER: &str = "pim";

/// Elementwise operators the pim target takes.
pub const PIM_SUPPORTED_OPS: &[&str] = &["add", "subtract", "multiply"];

/// Indicate that a given operator can be supported by `compiler`.
///
/// Installs a predicate under `target.<compiler>` that reports the operator
/// call as supported unconditionally. The operator must already be known to
/// the registry; unknown names fail there.
pub fn register_external_op_helper(op_name: &str, compiler: &str) -> Result<(), OpError> {
    register_op_attr(
        op_name,
        &target_key(compiler),
        OpAttr::TargetPredicate(Arc::new(|_call| true)),
    )?;
    debug!(op = op_name, compiler, "registered external op support");
    Ok(())
}

static PIM_OPS: OnceLock<()> = OnceLock::new();

/// Declare the operator set pim can take. Idempotent; the attributes are
/// installed once per process and never mutated afterwards.
pub fn register_pim_ops() {
    PIM_OPS.get_or_init(|| {
        for name in PIM_SUPPORTED_OPS {
            register_external_op_helper(name, PIM_COMPILER)
                .expect("builtin operator is registered");
        }
    });
}
