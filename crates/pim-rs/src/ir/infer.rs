//! Type checking and result-spec inference for expressions.

use thiserror::Error;

use super::{Call, Callee, DType, Expr, Function, Module, TensorSpec};
use crate::op::{self, OpKind};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InferError {
    #[error("unknown operator '{0}'")]
    UnknownOp(String),
    #[error("unknown global function '@{0}'")]
    UnknownGlobal(String),
    #[error("call to {callee} expects {want} arguments, got {got}")]
    ArityMismatch {
        callee: String,
        want: usize,
        got: usize,
    },
    #[error("operand specs {lhs} and {rhs} do not match for '{op}'")]
    OperandMismatch {
        op: String,
        lhs: TensorSpec,
        rhs: TensorSpec,
    },
    #[error("'{op}' requires f32 operands, got {dtype:?}")]
    DTypeNotSupported { op: String, dtype: DType },
    #[error("'{op}' requires a scalar f32 second operand, got {got}")]
    ScalarOperandRequired { op: String, got: TensorSpec },
    #[error("argument {index} of call to {callee} has spec {got}, expected {want}")]
    ArgumentSpecMismatch {
        callee: String,
        index: usize,
        got: TensorSpec,
        want: TensorSpec,
    },
}

/// Infers the result spec of a standalone expression. Calls to module-level
/// globals cannot be resolved here and report [`InferError::UnknownGlobal`].
pub fn infer_expr(expr: &Expr) -> Result<TensorSpec, InferError> {
    infer(expr, None)
}

/// Type-checks every function in the module.
pub fn infer_module(module: &Module) -> Result<(), InferError> {
    for (_, function) in module.functions() {
        infer(&function.body, Some(module))?;
    }
    Ok(())
}

pub(crate) fn infer_in(expr: &Expr, module: Option<&Module>) -> Result<TensorSpec, InferError> {
    infer(expr, module)
}

fn infer(expr: &Expr, module: Option<&Module>) -> Result<TensorSpec, InferError> {
    match expr {
        Expr::Var(var) => Ok(var.spec.clone()),
        Expr::Constant(constant) => Ok(constant.value.spec.clone()),
        Expr::Call(call) => infer_call(call, module),
    }
}

fn infer_call(call: &Call, module: Option<&Module>) -> Result<TensorSpec, InferError> {
    match &call.callee {
        Callee::Op(op) => {
            let def = op::op_def(op.name())
                .ok_or_else(|| InferError::UnknownOp(op.name().to_string()))?;
            let mut args = Vec::with_capacity(call.args.len());
            for arg in &call.args {
                args.push(infer(arg, module)?);
            }
            infer_op_call(op.name(), def.kind, &args)
        }
        Callee::Global(global) => {
            let function = module
                .and_then(|m| m.function(&global.name))
                .ok_or_else(|| InferError::UnknownGlobal(global.name.to_string()))?;
            infer_function_call(&format!("@{}", global.name), function, call, module)
        }
        Callee::Function(function) => infer_function_call("fn", function, call, module),
    }
}

pub(crate) fn infer_op_call(
    name: &str,
    kind: OpKind,
    args: &[TensorSpec],
) -> Result<TensorSpec, InferError> {
    match kind {
        OpKind::ElementwiseBinary(_) => {
            expect_arity(name, 2, args.len())?;
            let (lhs, rhs) = (&args[0], &args[1]);
            if lhs != rhs {
                return Err(InferError::OperandMismatch {
                    op: name.to_string(),
                    lhs: lhs.clone(),
                    rhs: rhs.clone(),
                });
            }
            if !lhs.dtype.is_float() {
                return Err(InferError::DTypeNotSupported {
                    op: name.to_string(),
                    dtype: lhs.dtype,
                });
            }
            Ok(lhs.clone())
        }
        OpKind::TutorialAdd => {
            expect_arity(name, 2, args.len())?;
            let (data, alpha) = (&args[0], &args[1]);
            if !data.dtype.is_float() {
                return Err(InferError::DTypeNotSupported {
                    op: name.to_string(),
                    dtype: data.dtype,
                });
            }
            if alpha.shape.rank() != 0 || !alpha.dtype.is_float() {
                return Err(InferError::ScalarOperandRequired {
                    op: name.to_string(),
                    got: alpha.clone(),
                });
            }
            Ok(data.clone())
        }
    }
}

fn infer_function_call(
    callee: &str,
    function: &Function,
    call: &Call,
    module: Option<&Module>,
) -> Result<TensorSpec, InferError> {
    expect_arity_named(callee, function.params.len(), call.args.len())?;
    for (index, (param, arg)) in function.params.iter().zip(call.args.iter()).enumerate() {
        let got = infer(arg, module)?;
        if got != param.spec {
            return Err(InferError::ArgumentSpecMismatch {
                callee: callee.to_string(),
                index,
                got,
                want: param.spec.clone(),
            });
        }
    }
    infer(&function.body, module)
}

fn expect_arity(op: &str, want: usize, got: usize) -> Result<(), InferError> {
    expect_arity_named(&format!("'{op}'"), want, got)
}

fn expect_arity_named(callee: &str, want: usize, got: usize) -> Result<(), InferError> {
    if want != got {
        return Err(InferError::ArityMismatch {
            callee: callee.to_string(),
            want,
            got,
        });
    }
    Ok(())
}
