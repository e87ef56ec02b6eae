//! C-source external codegen for the pim accelerator target.
//!
//! Partitioned subgraphs are lowered to self-contained C: one macro-generated
//! kernel per operator call and a wrapper function named by the subgraph's
//! global symbol. The produced module carries source only; executing it would
//! require a native build step, which is out of scope here.

mod codegen;

use std::sync::Arc;

use pim_rs::codegen::{register_codegen, CodegenError, CodegenResult, ExternalCodegen};
use pim_rs::ir::{Callee, DType, Expr, Function};
use pim_rs::op::contrib::pim::{register_pim_ops, PIM_COMPILER, PIM_SUPPORTED_OPS};
use pim_rs::runtime::{PackedFn, RuntimeModule, RuntimeResult};
use tracing::debug;

pub struct CSourceCodegen;

impl CSourceCodegen {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CSourceCodegen {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalCodegen for CSourceCodegen {
    fn name(&self) -> &str {
        PIM_COMPILER
    }

    fn version(&self) -> u64 {
        1
    }

    fn check(&self, function: &Function) -> CodegenResult<()> {
        for param in &function.params {
            check_tensor(param.spec.dtype, param.spec.shape.rank())?;
        }
        check_expr(&function.body)
    }

    fn compile(&self, function: &Function) -> CodegenResult<Arc<dyn RuntimeModule>> {
        self.check(function)?;
        let symbol = function
            .attrs
            .global_symbol
            .clone()
            .ok_or_else(|| CodegenError::new("subgraph function has no global_symbol"))?;
        let code = codegen::generate_c_module(function, &symbol)?;
        debug!(%symbol, bytes = code.len(), "generated C source module");
        Ok(Arc::new(CSourceModule { code }))
    }
}

fn check_tensor(dtype: DType, rank: usize) -> CodegenResult<()> {
    if dtype != DType::F32 {
        return Err(CodegenError::new(
            "only support single output tensor with float type",
        ));
    }
    if rank == 0 || rank > 2 {
        return Err(CodegenError::new(format!(
            "rank {rank} tensors are not supported; kernels cover 1-D and 2-D"
        )));
    }
    Ok(())
}

fn check_expr(expr: &Expr) -> CodegenResult<()> {
    match expr {
        Expr::Var(_) => Ok(()),
        Expr::Constant(_) => Err(CodegenError::new(
            "constants are lifted to subgraph inputs before codegen",
        )),
        Expr::Call(call) => {
            let Callee::Op(op) = &call.callee else {
                return Err(CodegenError::new(
                    "subgraph bodies may only call operators",
                ));
            };
            if !PIM_SUPPORTED_OPS.contains(&op.name()) {
                return Err(CodegenError::new(format!(
                    "unrecognized op '{}'",
                    op.name()
                )));
            }
            if call.args.len() != 2 {
                return Err(CodegenError::new(format!(
                    "'{}' expects 2 arguments, got {}",
                    op.name(),
                    call.args.len()
                )));
            }
            for arg in &call.args {
                check_expr(arg)?;
            }
            Ok(())
        }
    }
}

/// C source produced for one subgraph. Retrievable, saveable, not runnable.
pub struct CSourceModule {
    code: String,
}

impl RuntimeModule for CSourceModule {
    fn type_key(&self) -> &str {
        "c"
    }

    fn get_function(&self, _name: &str) -> Option<PackedFn> {
        None
    }

    fn source(&self, format: &str) -> Option<String> {
        (format == "c").then(|| self.code.clone())
    }

    fn save_to_bytes(&self) -> RuntimeResult<Vec<u8>> {
        Ok(self.code.clone().into_bytes())
    }
}

/// Register the pim operator set and the C-source codegen.
pub fn register_pim_codegen() {
    register_pim_ops();
    register_codegen(Arc::new(CSourceCodegen::new()));
}
