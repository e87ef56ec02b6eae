//! Example graph-text runtime backend.
//!
//! Registers an external codegen that lowers partitioned elementwise
//! subgraphs to a line-oriented graph text, plus the runtime module that
//! parses and executes that text. Unlike the C-source backend, modules
//! produced here are directly executable and reloadable through the module
//! loader registry.

mod graph;
mod module;

use std::sync::Arc;

use pim_rs::codegen::{register_codegen, CodegenError, CodegenResult, ExternalCodegen};
use pim_rs::ir::Function;
use pim_rs::runtime::{register_module_loader, RuntimeModule};
use tracing::debug;

pub use graph::{emit_graph_text, parse_graph_text, NodeEntry, ParsedGraph, SubgraphDef};
pub use module::{JsonGraphModule, EXAMPLE_JSON_TYPE_KEY};

pub struct JsonCodegen;

impl JsonCodegen {
    pub fn new() -> Self {
        Self
    }
}

impl Default for JsonCodegen {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalCodegen for JsonCodegen {
    fn name(&self) -> &str {
        EXAMPLE_JSON_TYPE_KEY
    }

    fn version(&self) -> u64 {
        1
    }

    fn compile(&self, function: &Function) -> CodegenResult<Arc<dyn RuntimeModule>> {
        let text = emit_graph_text(function)?;
        let module = JsonGraphModule::new(text)
            .map_err(|err| CodegenError::new(err.to_string()))?;
        debug!(
            symbol = function.attrs.global_symbol.as_deref().unwrap_or(""),
            "generated graph-text module"
        );
        Ok(Arc::new(module))
    }
}

/// Register the codegen and the binary module loader.
pub fn register_examplejson_backend() {
    register_codegen(Arc::new(JsonCodegen::new()));
    register_module_loader(
        EXAMPLE_JSON_TYPE_KEY,
        Arc::new(|bytes| {
            let text: String = bincode::deserialize(bytes)?;
            Ok(Arc::new(JsonGraphModule::new(text)?) as Arc<dyn RuntimeModule>)
        }),
    );
}

// Auto-register on library load
#[cfg(not(target_family = "wasm"))]
#[used]
#[link_section = ".init_array"]
static REGISTER_EXAMPLEJSON_BACKEND: extern "C" fn() = {
    extern "C" fn register() {
        register_examplejson_backend();
    }
    register
};
