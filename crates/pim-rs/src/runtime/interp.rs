//! Host-side expression interpreter.
//!
//! Evaluates the non-offloaded part of a module and dispatches calls to
//! partitioned globals (or pre-attributed inline functions) through packed
//! functions exported by the imported external modules.

use std::collections::HashMap;
use std::sync::Arc;

use crate::ir::{Call, Callee, Expr, Function, Module};
use crate::op::{self, ElementwiseBinaryOp, OpKind};

use super::{PackedFn, RuntimeError, RuntimeModule, RuntimeResult, Tensor};

pub struct Interpreter {
    module: Module,
    externals: HashMap<String, PackedFn>,
}

impl Interpreter {
    pub fn new(module: Module) -> Self {
        Self::with_externals(module, HashMap::new())
    }

    pub fn with_externals(module: Module, externals: HashMap<String, PackedFn>) -> Self {
        Self { module, externals }
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn eval_entry(&self, inputs: &[Tensor]) -> RuntimeResult<Tensor> {
        let entry = self.module.entry.clone();
        self.eval_named(&entry, inputs)
    }

    pub fn eval_named(&self, name: &str, inputs: &[Tensor]) -> RuntimeResult<Tensor> {
        let function = self
            .module
            .function(name)
            .ok_or_else(|| RuntimeError::execution(format!("function '@{name}' not found")))?;
        self.eval_function(function, inputs)
    }

    fn eval_function(&self, function: &Function, inputs: &[Tensor]) -> RuntimeResult<Tensor> {
        if function.params.len() != inputs.len() {
            return Err(RuntimeError::ArityMismatch {
                want: function.params.len(),
                got: inputs.len(),
            });
        }
        let mut env: HashMap<Arc<str>, Tensor> = HashMap::with_capacity(inputs.len());
        for (index, (param, input)) in function.params.iter().zip(inputs.iter()).enumerate() {
            if *input.spec() != param.spec {
                return Err(RuntimeError::InputSpecMismatch {
                    index,
                    got: input.spec().clone(),
                    want: param.spec.clone(),
                });
            }
            env.insert(param.name.clone(), input.clone());
        }
        self.eval(&function.body, &env)
    }

    fn eval(&self, expr: &Expr, env: &HashMap<Arc<str>, Tensor>) -> RuntimeResult<Tensor> {
        match expr {
            Expr::Var(var) => env
                .get(&var.name)
                .cloned()
                .ok_or_else(|| RuntimeError::UnboundVar(var.name.to_string())),
            Expr::Constant(constant) => Ok(Tensor::from_literal(&constant.value)),
            Expr::Call(call) => self.eval_call(call, env),
        }
    }

    fn eval_call(&self, call: &Call, env: &HashMap<Arc<str>, Tensor>) -> RuntimeResult<Tensor> {
        let mut args = Vec::with_capacity(call.args.len());
        for arg in &call.args {
            args.push(self.eval(arg, env)?);
        }
        match &call.callee {
            Callee::Op(op) => {
                let def = op::op_def(op.name())
                    .ok_or_else(|| RuntimeError::UnknownOp(op.name().to_string()))?;
                eval_op(op.name(), def.kind, &args)
            }
            Callee::Global(global) => {
                let function = self.module.function(&global.name).ok_or_else(|| {
                    RuntimeError::execution(format!("function '@{}' not found", global.name))
                })?;
                self.apply_function(&global.name, function, &args)
            }
            Callee::Function(function) => self.apply_function("fn", function, &args),
        }
    }

    fn apply_function(
        &self,
        name: &str,
        function: &Function,
        args: &[Tensor],
    ) -> RuntimeResult<Tensor> {
        if function.attrs.is_external() {
            let symbol = function
                .attrs
                .global_symbol
                .as_deref()
                .unwrap_or(name);
            let packed = self
                .externals
                .get(symbol)
                .ok_or_else(|| RuntimeError::MissingExternal(symbol.to_string()))?;
            return packed(args);
        }
        self.eval_function(function, args)
    }
}

fn eval_op(name: &str, kind: OpKind, args: &[Tensor]) -> RuntimeResult<Tensor> {
    match kind {
        OpKind::ElementwiseBinary(op) => {
            expect_arity(2, args.len())?;
            elementwise_binary(op, &args[0], &args[1])
        }
        OpKind::TutorialAdd => {
            expect_arity(2, args.len())?;
            let alpha = args[1].scalar().ok_or_else(|| {
                RuntimeError::execution(format!("'{name}' requires a scalar second operand"))
            })?;
            let values: Vec<f32> = args[0].values().iter().map(|v| v + alpha).collect();
            Tensor::new(args[0].spec().clone(), values)
        }
    }
}

fn expect_arity(want: usize, got: usize) -> RuntimeResult<()> {
    if want != got {
        return Err(RuntimeError::ArityMismatch { want, got });
    }
    Ok(())
}

fn elementwise_binary(
    op: ElementwiseBinaryOp,
    lhs: &Tensor,
    rhs: &Tensor,
) -> RuntimeResult<Tensor> {
    if lhs.spec() != rhs.spec() {
        return Err(RuntimeError::SpecMismatch {
            lhs: lhs.spec().clone(),
            rhs: rhs.spec().clone(),
        });
    }
    let values: Vec<f32> = lhs
        .values()
        .iter()
        .zip(rhs.values())
        .map(|(a, b)| apply_binary(op, *a, *b))
        .collect();
    Tensor::new(lhs.spec().clone(), values)
}

fn apply_binary(op: ElementwiseBinaryOp, a: f32, b: f32) -> f32 {
    match op {
        ElementwiseBinaryOp::Add => a + b,
        ElementwiseBinaryOp::Subtract => a - b,
        ElementwiseBinaryOp::Multiply => a * b,
        ElementwiseBinaryOp::Divide => a / b,
        ElementwiseBinaryOp::Maximum => a.max(b),
        ElementwiseBinaryOp::Minimum => a.min(b),
    }
}

/// Wraps the interpreter as the artifact's `"default"` runtime module.
pub struct HostModule {
    interp: Arc<Interpreter>,
}

impl HostModule {
    pub fn new(module: Module, externals: HashMap<String, PackedFn>) -> Self {
        Self {
            interp: Arc::new(Interpreter::with_externals(module, externals)),
        }
    }
}

impl RuntimeModule for HostModule {
    fn type_key(&self) -> &str {
        "host"
    }

    fn get_function(&self, name: &str) -> Option<PackedFn> {
        let function = self.interp.module().function(name)?;
        if function.attrs.is_external() {
            return None;
        }
        let interp = Arc::clone(&self.interp);
        let name = name.to_string();
        Some(Arc::new(move |inputs| interp.eval_named(&name, inputs)))
    }

    fn source(&self, format: &str) -> Option<String> {
        (format == "text").then(|| self.interp.module().to_text())
    }

    fn save_to_bytes(&self) -> RuntimeResult<Vec<u8>> {
        Err(RuntimeError::unimplemented(
            "host module serialization",
            "interpreted modules are rebuilt from IR, not reloaded",
        ))
    }
}
