//! Runtime module executing graph-text subgraphs over a data-entry pool.

use std::sync::Arc;

use pim_rs::runtime::{PackedFn, RuntimeError, RuntimeModule, RuntimeResult, Tensor};

use crate::graph::{parse_graph_text, ParsedGraph};

pub const EXAMPLE_JSON_TYPE_KEY: &str = "examplejson";

struct GraphData {
    text: String,
    graph: ParsedGraph,
}

/// Parses the graph text at construction and serves one packed function per
/// subgraph. Execution copies caller arguments into the data-entry pool,
/// runs each node in order, and returns the last node's output.
pub struct JsonGraphModule {
    data: Arc<GraphData>,
}

impl JsonGraphModule {
    pub fn new(text: impl Into<String>) -> RuntimeResult<Self> {
        let text = text.into();
        let graph = parse_graph_text(&text)?;
        Ok(Self {
            data: Arc::new(GraphData { text, graph }),
        })
    }

    /// Loads raw graph text from disk.
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> RuntimeResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::new(text)
    }

    pub fn graph_text(&self) -> &str {
        &self.data.text
    }
}

impl RuntimeModule for JsonGraphModule {
    fn type_key(&self) -> &str {
        EXAMPLE_JSON_TYPE_KEY
    }

    fn get_function(&self, name: &str) -> Option<PackedFn> {
        if !self.data.graph.subgraphs.contains_key(name) {
            return None;
        }
        let data = Arc::clone(&self.data);
        let name = name.to_string();
        Some(Arc::new(move |args| run_subgraph(&data, &name, args)))
    }

    fn source(&self, format: &str) -> Option<String> {
        match format {
            "json" => serde_json::to_string_pretty(&self.data.graph).ok(),
            _ => Some(self.data.text.clone()),
        }
    }

    fn save_to_bytes(&self) -> RuntimeResult<Vec<u8>> {
        Ok(bincode::serialize(&self.data.text)?)
    }
}

fn run_subgraph(data: &GraphData, name: &str, args: &[Tensor]) -> RuntimeResult<Tensor> {
    let subgraph = data
        .graph
        .subgraphs
        .get(name)
        .ok_or_else(|| RuntimeError::UnknownSubgraph(name.to_string()))?;

    if args.len() != subgraph.inputs.len() {
        return Err(RuntimeError::ArityMismatch {
            want: subgraph.inputs.len(),
            got: args.len(),
        });
    }

    let mut pool: Vec<Option<Tensor>> = vec![None; data.graph.shapes.len()];
    for (index, (&id, arg)) in subgraph.inputs.iter().zip(args.iter()).enumerate() {
        let dims = data.graph.shapes[id]
            .as_deref()
            .ok_or_else(|| RuntimeError::execution(format!("data entry {id} has no shape")))?;
        if arg.spec().shape.dims() != dims {
            return Err(RuntimeError::InputSpecMismatch {
                index,
                got: arg.spec().clone(),
                want: pim_rs::ir::TensorSpec::f32(dims.to_vec()),
            });
        }
        pool[id] = Some(arg.clone());
    }

    for node in &subgraph.nodes {
        if node.inputs.len() != 2 {
            return Err(RuntimeError::execution(format!(
                "node {} expects 2 inputs, got {}",
                node.id,
                node.inputs.len()
            )));
        }
        let lhs = entry(&pool, node.inputs[0])?;
        let rhs = entry(&pool, node.inputs[1])?;
        let out = binary_node(&node.op, lhs, rhs)?;
        pool[node.id] = Some(out);
    }

    let last = subgraph
        .nodes
        .last()
        .ok_or_else(|| RuntimeError::execution(format!("subgraph '{name}' has no nodes")))?;
    entry(&pool, last.id).cloned()
}

fn entry(pool: &[Option<Tensor>], id: usize) -> RuntimeResult<&Tensor> {
    pool.get(id)
        .and_then(Option::as_ref)
        .ok_or_else(|| RuntimeError::execution(format!("data entry {id} is uninitialized")))
}

fn binary_node(op: &str, lhs: &Tensor, rhs: &Tensor) -> RuntimeResult<Tensor> {
    if lhs.spec() != rhs.spec() {
        return Err(RuntimeError::SpecMismatch {
            lhs: lhs.spec().clone(),
            rhs: rhs.spec().clone(),
        });
    }
    let combine: fn(f32, f32) -> f32 = match op {
        "add" => |a, b| a + b,
        "sub" => |a, b| a - b,
        "mul" => |a, b| a * b,
        _ => return Err(RuntimeError::UnknownOp(op.to_string())),
    };
    let values: Vec<f32> = lhs
        .values()
        .iter()
        .zip(rhs.values())
        .map(|(a, b)| combine(*a, *b))
        .collect();
    Tensor::new(lhs.spec().clone(), values)
}
