//! Line-oriented graph text for offloaded elementwise subgraphs.
//!
//! The format carries one `subgraph_<symbol>` header per subgraph followed by
//! `input <id> <dims...>` declarations and `<op> <id> inputs: <ids...>
//! shape: <dims...>` nodes, where `<op>` is `add`, `sub`, or `mul`.

use std::collections::BTreeMap;

use pim_rs::codegen::{CodegenError, CodegenResult};
use pim_rs::ir::{Callee, Expr, Function};
use pim_rs::runtime::{RuntimeError, RuntimeResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub id: usize,
    pub op: String,
    pub inputs: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubgraphDef {
    /// Data-entry ids fed by caller arguments, in declaration order.
    pub inputs: Vec<usize>,
    pub nodes: Vec<NodeEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedGraph {
    pub subgraphs: BTreeMap<String, SubgraphDef>,
    /// Tensor shape per data-entry id.
    pub shapes: Vec<Option<Vec<usize>>>,
}

impl ParsedGraph {
    fn shape_slot(&mut self, id: usize) -> &mut Option<Vec<usize>> {
        if self.shapes.len() <= id {
            self.shapes.resize(id + 1, None);
        }
        &mut self.shapes[id]
    }
}

pub fn parse_graph_text(text: &str) -> RuntimeResult<ParsedGraph> {
    let mut graph = ParsedGraph::default();
    let mut current: Option<String> = None;

    for line in text.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&first) = tokens.first() else {
            continue;
        };

        if let Some(symbol) = first.strip_prefix("subgraph_") {
            graph.subgraphs.entry(symbol.to_string()).or_default();
            current = Some(symbol.to_string());
            continue;
        }
        let symbol = current
            .clone()
            .ok_or_else(|| malformed(line, "node line before any subgraph header"))?;

        if first == "input" {
            let id = parse_id(&tokens, 1, line)?;
            let dims = parse_dims(&tokens[2..], line)?;
            *graph.shape_slot(id) = Some(dims);
            let subgraph = graph.subgraphs.get_mut(&symbol).expect("current subgraph");
            subgraph.inputs.push(id);
            continue;
        }

        // Op node: `<op> <id> inputs: <ids...> shape: <dims...>`
        let id = parse_id(&tokens, 1, line)?;
        let mut inputs = Vec::new();
        let mut dims = Vec::new();
        let mut in_shape = false;
        for token in &tokens[2..] {
            match *token {
                "inputs:" => {}
                "shape:" => in_shape = true,
                value => {
                    let value: usize = value
                        .parse()
                        .map_err(|_| malformed(line, "expected an integer token"))?;
                    if in_shape {
                        dims.push(value);
                    } else {
                        inputs.push(value);
                    }
                }
            }
        }
        *graph.shape_slot(id) = Some(dims);
        let subgraph = graph.subgraphs.get_mut(&symbol).expect("current subgraph");
        subgraph.nodes.push(NodeEntry {
            id,
            op: first.to_string(),
            inputs,
        });
    }
    Ok(graph)
}

fn parse_id(tokens: &[&str], index: usize, line: &str) -> RuntimeResult<usize> {
    tokens
        .get(index)
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| malformed(line, "expected a data-entry id"))
}

fn parse_dims(tokens: &[&str], line: &str) -> RuntimeResult<Vec<usize>> {
    tokens
        .iter()
        .map(|t| {
            t.parse()
                .map_err(|_| malformed(line, "expected a shape extent"))
        })
        .collect()
}

fn malformed(line: &str, reason: &str) -> RuntimeError {
    RuntimeError::execution(format!("malformed graph line '{line}': {reason}"))
}

/// Lowers a partitioned function to graph text. Only elementwise
/// add/subtract/multiply bodies over the function parameters are accepted.
pub fn emit_graph_text(function: &Function) -> CodegenResult<String> {
    let symbol = function
        .attrs
        .global_symbol
        .as_deref()
        .ok_or_else(|| CodegenError::new("subgraph function has no global_symbol"))?;

    let mut lines = vec![format!("subgraph_{symbol}")];
    let mut param_ids: Vec<(&str, usize)> = Vec::new();
    for (id, param) in function.params.iter().enumerate() {
        let dims = param
            .spec
            .shape
            .dims()
            .iter()
            .map(usize::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        lines.push(format!("input {id} {dims}").trim_end().to_string());
        param_ids.push((&*param.name, id));
    }

    let mut next_id = function.params.len();
    emit_expr(&function.body, &param_ids, &mut next_id, &mut lines)?;
    Ok(lines.join("\n") + "\n")
}

// Postorder emission; returns the data-entry id and shape of the expression.
fn emit_expr(
    expr: &Expr,
    params: &[(&str, usize)],
    next_id: &mut usize,
    lines: &mut Vec<String>,
) -> CodegenResult<(usize, Vec<usize>)> {
    match expr {
        Expr::Var(var) => {
            let id = params
                .iter()
                .find(|(name, _)| *name == &*var.name)
                .map(|(_, id)| *id)
                .ok_or_else(|| {
                    CodegenError::new(format!("variable '%{}' is not a subgraph input", var.name))
                })?;
            Ok((id, var.spec.shape.dims().to_vec()))
        }
        Expr::Constant(_) => Err(CodegenError::new(
            "constants are lifted to subgraph inputs before codegen",
        )),
        Expr::Call(call) => {
            let Callee::Op(op) = &call.callee else {
                return Err(CodegenError::new("subgraph bodies may only call operators"));
            };
            let token = op_token(op.name())?;
            if call.args.len() != 2 {
                return Err(CodegenError::new(format!(
                    "'{}' expects 2 arguments, got {}",
                    op.name(),
                    call.args.len()
                )));
            }
            let (lhs_id, shape) = emit_expr(&call.args[0], params, next_id, lines)?;
            let (rhs_id, _) = emit_expr(&call.args[1], params, next_id, lines)?;
            let id = *next_id;
            *next_id += 1;
            let dims = shape
                .iter()
                .map(usize::to_string)
                .collect::<Vec<_>>()
                .join(" ");
            lines.push(
                format!("{token} {id} inputs: {lhs_id} {rhs_id} shape: {dims}")
                    .trim_end()
                    .to_string(),
            );
            Ok((id, shape))
        }
    }
}

fn op_token(name: &str) -> CodegenResult<&'static str> {
    match name {
        "add" => Ok("add"),
        "subtract" => Ok("sub"),
        "multiply" => Ok("mul"),
        _ => Err(CodegenError::new(format!("unknown op: {name}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pim_rs::ir::{TensorSpec, Var};
    use pim_rs::op;

    fn subgraph_function(symbol: &str) -> Function {
        let spec = TensorSpec::f32(vec![2, 2]);
        let x = Var::new("x", spec.clone());
        let y = Var::new("y", spec);
        let body = op::add(
            op::multiply(Expr::Var(x.clone()), Expr::Var(y.clone())),
            Expr::Var(x.clone()),
        );
        Function::new(vec![x, y], body).set_external("examplejson", symbol)
    }

    #[test]
    fn emit_then_parse_round_trips() {
        let text = emit_graph_text(&subgraph_function("examplejson_0")).expect("emit");
        assert!(text.starts_with("subgraph_examplejson_0\n"));
        assert!(text.contains("input 0 2 2"));
        assert!(text.contains("mul 2 inputs: 0 1 shape: 2 2"));
        assert!(text.contains("add 3 inputs: 2 0 shape: 2 2"));

        let graph = parse_graph_text(&text).expect("parse");
        let subgraph = graph.subgraphs.get("examplejson_0").expect("subgraph");
        assert_eq!(subgraph.inputs, vec![0, 1]);
        assert_eq!(subgraph.nodes.len(), 2);
        assert_eq!(subgraph.nodes[1].op, "add");
        assert_eq!(graph.shapes[3].as_deref(), Some(&[2usize, 2][..]));
    }

    #[test]
    fn divide_is_not_expressible() {
        let spec = TensorSpec::f32(vec![2]);
        let x = Var::new("x", spec.clone());
        let y = Var::new("y", spec);
        let body = op::divide(Expr::Var(x.clone()), Expr::Var(y.clone()));
        let function = Function::new(vec![x, y], body).set_external("examplejson", "examplejson_1");
        let err = emit_graph_text(&function).unwrap_err();
        assert!(err.to_string().contains("unknown op: divide"));
    }

    #[test]
    fn node_line_before_header_is_rejected() {
        let err = parse_graph_text("input 0 2 2\n").unwrap_err();
        assert!(err.to_string().contains("before any subgraph header"));
    }
}
