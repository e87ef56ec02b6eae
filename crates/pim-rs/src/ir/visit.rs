use std::collections::HashSet;
use std::sync::Arc;

use super::{Call, Callee, Constant, Expr, Function, Var};

/// Read-only expression walker. Callbacks fire before children are visited.
pub trait ExprVisitor {
    fn on_var(&mut self, _var: &Var) {}
    fn on_constant(&mut self, _constant: &Constant) {}
    fn on_call(&mut self, _call: &Call) {}
    fn on_function(&mut self, _function: &Function) {}
}

pub fn walk_expr<V: ExprVisitor + ?Sized>(expr: &Expr, visitor: &mut V) {
    match expr {
        Expr::Var(var) => visitor.on_var(var),
        Expr::Constant(constant) => visitor.on_constant(constant),
        Expr::Call(call) => {
            visitor.on_call(call);
            if let Callee::Function(function) = &call.callee {
                visitor.on_function(function);
                walk_expr(&function.body, visitor);
            }
            for arg in &call.args {
                walk_expr(arg, visitor);
            }
        }
    }
}

/// Free variables of an expression in first-occurrence order. Parameters of
/// inline function values bind their bodies.
pub fn free_vars(expr: &Expr) -> Vec<Var> {
    let mut bound: Vec<Arc<str>> = Vec::new();
    let mut seen: HashSet<Arc<str>> = HashSet::new();
    let mut out = Vec::new();
    collect_free_vars(expr, &mut bound, &mut seen, &mut out);
    out
}

fn collect_free_vars(
    expr: &Expr,
    bound: &mut Vec<Arc<str>>,
    seen: &mut HashSet<Arc<str>>,
    out: &mut Vec<Var>,
) {
    match expr {
        Expr::Var(var) => {
            if !bound.contains(&var.name) && seen.insert(var.name.clone()) {
                out.push(var.clone());
            }
        }
        Expr::Constant(_) => {}
        Expr::Call(call) => {
            if let Callee::Function(function) = &call.callee {
                let mark = bound.len();
                bound.extend(function.params.iter().map(|p| p.name.clone()));
                collect_free_vars(&function.body, bound, seen, out);
                bound.truncate(mark);
            }
            for arg in &call.args {
                collect_free_vars(arg, bound, seen, out);
            }
        }
    }
}
