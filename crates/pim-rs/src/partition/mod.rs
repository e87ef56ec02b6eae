//! Graph annotation and partitioning for external offload.
//!
//! `annotate_target` walks a module's host functions and marks every operator
//! call a compiler's support predicate claims. `partition_graph` then lifts
//! maximal claimed subtrees into module-level functions tagged with
//! `compiler` and `global_symbol` attributes, rewriting the call sites to
//! call the new globals. Regions never span unsupported operators, and
//! inline function values that already carry a compiler attribute are left
//! untouched (they are pre-partitioned by hand).

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use crate::ir::infer::{infer_in, infer_op_call};
use crate::ir::{
    Call, Callee, Expr, Function, GlobalVar, InferError, Module, TensorSpec, Var,
};
use crate::op;

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error(transparent)]
    Infer(#[from] InferError),
}

/// Compiler assignments keyed by (function name, post-order call index).
#[derive(Debug, Clone, Default)]
pub struct TargetMap {
    by_function: HashMap<String, HashMap<usize, String>>,
}

impl TargetMap {
    pub fn is_empty(&self) -> bool {
        self.by_function.values().all(HashMap::is_empty)
    }

    pub fn compiler_for(&self, function: &str, index: usize) -> Option<&str> {
        self.by_function
            .get(function)?
            .get(&index)
            .map(String::as_str)
    }

    pub fn assigned(&self, function: &str) -> usize {
        self.by_function.get(function).map_or(0, HashMap::len)
    }
}

/// Marks every operator call claimed by `compiler`'s support predicates.
/// Calls already claimed by an earlier annotation keep their first claim.
pub fn annotate_target(module: &Module, compiler: &str, targets: &mut TargetMap) {
    for (name, function) in module.functions() {
        if function.attrs.is_external() {
            continue;
        }
        let assignments = targets.by_function.entry(name.to_string()).or_default();
        let mut index = 0usize;
        visit_calls(&function.body, &mut index, &mut |idx, call| {
            if assignments.contains_key(&idx) {
                return;
            }
            if op::is_call_supported(call, compiler) {
                assignments.insert(idx, compiler.to_string());
            }
        });
    }
}

// Post-order call enumeration shared by annotation and partitioning. Inline
// function bodies are not entered.
fn visit_calls(expr: &Expr, index: &mut usize, f: &mut impl FnMut(usize, &Call)) {
    if let Expr::Call(call) = expr {
        for arg in &call.args {
            visit_calls(arg, index, f);
        }
        let idx = *index;
        *index += 1;
        f(idx, call);
    }
}

/// Lifts claimed subtrees out of the module's host functions.
pub fn partition_graph(module: &Module, targets: &TargetMap) -> Result<Module, PartitionError> {
    let mut out = Module::new();
    out.entry = module.entry.clone();
    let mut counters: HashMap<String, usize> = HashMap::new();
    let mut lifted: Vec<(String, Function)> = Vec::new();

    for (name, function) in module.functions() {
        if function.attrs.is_external() {
            out.add_function(name, function.clone());
            continue;
        }
        let empty = HashMap::new();
        let assignments = targets.by_function.get(name).unwrap_or(&empty);
        let mut partitioner = Partitioner {
            module,
            assignments,
            next_index: 0,
            fresh_params: 0,
            counters: &mut counters,
            lifted: &mut lifted,
        };
        let (rewritten, _) = partitioner.rewrite(&function.body)?;
        let body = match rewritten {
            Rewritten::Host(expr) => expr,
            Rewritten::Claimed(region) => partitioner.cut(region),
        };
        let mut host = function.clone();
        host.body = body;
        out.add_function(name, host);
    }

    for (symbol, function) in lifted {
        out.add_function(symbol, function);
    }
    Ok(out)
}

/// Annotate for each compiler (in the given order) and partition.
pub fn partition_module(module: &Module, compilers: &[String]) -> Result<Module, PartitionError> {
    let mut targets = TargetMap::default();
    for compiler in compilers {
        annotate_target(module, compiler, &mut targets);
    }
    if targets.is_empty() {
        return Ok(module.clone());
    }
    partition_graph(module, &targets)
}

// A claimed subtree that has not been cut yet: `body` is expressed over the
// fresh `inputs` parameters, each fed by a host-side expression.
struct Region {
    compiler: String,
    body: Expr,
    inputs: Vec<(Var, Expr)>,
}

enum Rewritten {
    Host(Expr),
    Claimed(Region),
}

struct Partitioner<'a> {
    module: &'a Module,
    assignments: &'a HashMap<usize, String>,
    next_index: usize,
    // Fresh parameter counter shared by every region cut from one function,
    // so merged sibling regions cannot collide on parameter names.
    fresh_params: usize,
    counters: &'a mut HashMap<String, usize>,
    lifted: &'a mut Vec<(String, Function)>,
}

impl Partitioner<'_> {
    fn rewrite(&mut self, expr: &Expr) -> Result<(Rewritten, TensorSpec), PartitionError> {
        match expr {
            Expr::Var(var) => Ok((Rewritten::Host(expr.clone()), var.spec.clone())),
            Expr::Constant(constant) => {
                Ok((Rewritten::Host(expr.clone()), constant.value.spec.clone()))
            }
            Expr::Call(call) => self.rewrite_call(call),
        }
    }

    fn rewrite_call(&mut self, call: &Call) -> Result<(Rewritten, TensorSpec), PartitionError> {
        let mut args = Vec::with_capacity(call.args.len());
        for arg in &call.args {
            args.push(self.rewrite(arg)?);
        }
        let index = self.next_index;
        self.next_index += 1;

        let spec = self.call_spec(call, &args)?;
        let claim = self.assignments.get(&index).cloned();

        match claim {
            Some(compiler) => {
                let mut inputs: Vec<(Var, Expr)> = Vec::new();
                let mut body_args = Vec::with_capacity(args.len());
                for (rewritten, arg_spec) in args {
                    let body_arg = match rewritten {
                        Rewritten::Claimed(region) if region.compiler == compiler => {
                            for input in region.inputs {
                                merge_input(&mut inputs, input);
                            }
                            region.body
                        }
                        Rewritten::Claimed(region) => {
                            let host = self.cut(region);
                            region_input(&mut inputs, host, arg_spec, &mut self.fresh_params)
                        }
                        Rewritten::Host(host) => {
                            region_input(&mut inputs, host, arg_spec, &mut self.fresh_params)
                        }
                    };
                    body_args.push(body_arg);
                }
                let body = Expr::call(call.callee.clone(), body_args);
                Ok((
                    Rewritten::Claimed(Region {
                        compiler,
                        body,
                        inputs,
                    }),
                    spec,
                ))
            }
            None => {
                let mut host_args = Vec::with_capacity(args.len());
                for (rewritten, _) in args {
                    host_args.push(match rewritten {
                        Rewritten::Host(host) => host,
                        Rewritten::Claimed(region) => self.cut(region),
                    });
                }
                Ok((
                    Rewritten::Host(Expr::call(call.callee.clone(), host_args)),
                    spec,
                ))
            }
        }
    }

    // Result spec from already-computed argument specs; rewritten arguments
    // may reference freshly cut globals, so only original subtrees ever reach
    // the inference entry points.
    fn call_spec(
        &self,
        call: &Call,
        args: &[(Rewritten, TensorSpec)],
    ) -> Result<TensorSpec, PartitionError> {
        let arg_specs: Vec<TensorSpec> = args.iter().map(|(_, spec)| spec.clone()).collect();
        let spec = match &call.callee {
            Callee::Op(op) => {
                let def = op::op_def(op.name())
                    .ok_or_else(|| InferError::UnknownOp(op.name().to_string()))?;
                infer_op_call(op.name(), def.kind, &arg_specs)?
            }
            Callee::Global(global) => {
                let function = self
                    .module
                    .function(&global.name)
                    .ok_or_else(|| InferError::UnknownGlobal(global.name.to_string()))?;
                infer_in(&function.body, Some(self.module))?
            }
            Callee::Function(function) => infer_in(&function.body, Some(self.module))?,
        };
        Ok(spec)
    }

    // Turns a region into a module-level external function and returns the
    // replacement call site.
    fn cut(&mut self, region: Region) -> Expr {
        let counter = self.counters.entry(region.compiler.clone()).or_insert(0);
        let symbol = format!("{}_{}", region.compiler, *counter);
        *counter += 1;

        let params: Vec<Var> = region.inputs.iter().map(|(var, _)| var.clone()).collect();
        let args: Vec<Expr> = region.inputs.into_iter().map(|(_, expr)| expr).collect();
        let function = Function::new(params, region.body)
            .set_external(region.compiler.clone(), symbol.clone());
        debug!(%symbol, compiler = %region.compiler, "partitioned subgraph");
        self.lifted.push((symbol.clone(), function));
        Expr::call(Callee::Global(GlobalVar::new(symbol)), args)
    }
}

// Feeds a host expression into a region, reusing an existing input when the
// same expression is already wired in.
fn region_input(
    inputs: &mut Vec<(Var, Expr)>,
    host: Expr,
    spec: TensorSpec,
    fresh: &mut usize,
) -> Expr {
    if let Some((var, _)) = inputs.iter().find(|(_, expr)| *expr == host) {
        return Expr::Var(var.clone());
    }
    let var = match &host {
        Expr::Var(var) => var.clone(),
        _ => {
            let var = Var::new(format!("arg{fresh}"), spec);
            *fresh += 1;
            var
        }
    };
    inputs.push((var.clone(), host));
    Expr::Var(var)
}

fn merge_input(inputs: &mut Vec<(Var, Expr)>, input: (Var, Expr)) {
    if inputs.iter().any(|(_, expr)| *expr == input.1) {
        return;
    }
    inputs.push(input);
}
