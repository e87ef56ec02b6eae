//! Build pipeline: type-check, partition, run external codegens, and
//! assemble the runtime artifact.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::codegen::{get_codegen, list_codegens, CodegenError};
use crate::ir::{infer_module, walk_expr, Call, Callee, ExprVisitor, Function, InferError, Module};
use crate::partition::{partition_module, PartitionError};
use crate::runtime::{HostModule, PackedFn, RuntimeModule};

/// Key under which the host executor module is stored in the artifact.
pub const DEFAULT_MODULE_KEY: &str = "default";

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Infer(#[from] InferError),
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error("no codegen registered for compiler '{0}'")]
    MissingCodegen(String),
    #[error("codegen for '{compiler}' failed: {source}")]
    Codegen {
        compiler: String,
        source: CodegenError,
    },
    #[error("external function '{0}' has no global_symbol attribute")]
    MissingSymbol(String),
}

#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Run annotation and partitioning before codegen. Disable for modules
    /// that were partitioned (or hand-attributed) already.
    pub partition: bool,
    /// Compilers to annotate for; defaults to every registered codegen, in
    /// sorted-name order.
    pub targets: Option<Vec<String>>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            partition: true,
            targets: None,
        }
    }
}

/// Compiled build output: runtime modules retrievable by key.
pub struct Artifact {
    entry: String,
    modules: HashMap<String, Arc<dyn RuntimeModule>>,
}

impl std::fmt::Debug for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Artifact")
            .field("entry", &self.entry)
            .field("modules", &self.keys())
            .finish()
    }
}

impl Artifact {
    pub fn module(&self, key: &str) -> Option<Arc<dyn RuntimeModule>> {
        self.modules.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.modules.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Packed entry function of the host executor module.
    pub fn entry_function(&self) -> Option<PackedFn> {
        self.module(DEFAULT_MODULE_KEY)?.get_function(&self.entry)
    }
}

pub fn build(module: Module) -> Result<Artifact, BuildError> {
    build_with_config(module, &BuildConfig::default())
}

pub fn build_with_config(module: Module, config: &BuildConfig) -> Result<Artifact, BuildError> {
    infer_module(&module)?;

    let module = if config.partition {
        let targets = match &config.targets {
            Some(targets) => targets.clone(),
            None => list_codegens(),
        };
        debug!(?targets, "annotating module");
        partition_module(&module, &targets)?
    } else {
        module
    };

    let mut modules: HashMap<String, Arc<dyn RuntimeModule>> = HashMap::new();
    let mut externals: HashMap<String, PackedFn> = HashMap::new();

    for (name, function) in module.external_functions() {
        compile_external(name, function, &mut modules, &mut externals)?;
    }
    for function in collect_inline_externals(&module) {
        let hint = function
            .attrs
            .global_symbol
            .clone()
            .unwrap_or_else(|| "fn".to_string());
        compile_external(&hint, &function, &mut modules, &mut externals)?;
    }

    info!(
        external = modules.len(),
        executable = externals.len(),
        entry = %module.entry,
        "build complete"
    );

    let entry = module.entry.clone();
    let host = HostModule::new(module, externals);
    modules.insert(DEFAULT_MODULE_KEY.to_string(), Arc::new(host));
    Ok(Artifact { entry, modules })
}

fn compile_external(
    name: &str,
    function: &Function,
    modules: &mut HashMap<String, Arc<dyn RuntimeModule>>,
    externals: &mut HashMap<String, PackedFn>,
) -> Result<(), BuildError> {
    // Both call sites filter on `is_external`, which means a compiler attr.
    let compiler = function
        .attrs
        .compiler
        .clone()
        .expect("external function carries a compiler attribute");
    let symbol = function
        .attrs
        .global_symbol
        .clone()
        .ok_or_else(|| BuildError::MissingSymbol(name.to_string()))?;
    if modules.contains_key(&symbol) {
        return Ok(());
    }

    let codegen =
        get_codegen(&compiler).ok_or_else(|| BuildError::MissingCodegen(compiler.clone()))?;
    codegen.check(function).map_err(|source| BuildError::Codegen {
        compiler: compiler.clone(),
        source,
    })?;
    let module = codegen
        .compile(function)
        .map_err(|source| BuildError::Codegen {
            compiler: compiler.clone(),
            source,
        })?;
    debug!(%symbol, %compiler, type_key = module.type_key(), "compiled external function");

    if let Some(packed) = module.get_function(&symbol) {
        externals.insert(symbol.clone(), packed);
    }
    modules.insert(symbol, module);
    Ok(())
}

// Pre-partitioned function values embedded in host bodies, deduplicated by
// symbol.
fn collect_inline_externals(module: &Module) -> Vec<Arc<Function>> {
    struct Collector {
        seen: Vec<Arc<Function>>,
    }
    impl ExprVisitor for Collector {
        fn on_call(&mut self, call: &Call) {
            if let Callee::Function(function) = &call.callee {
                if function.attrs.is_external()
                    && !self.seen.iter().any(|f| {
                        f.attrs.global_symbol == function.attrs.global_symbol
                    })
                {
                    self.seen.push(function.clone());
                }
            }
        }
    }

    let mut collector = Collector { seen: Vec::new() };
    for (_, function) in module.functions() {
        if !function.attrs.is_external() {
            walk_expr(&function.body, &mut collector);
        }
    }
    collector.seen
}
