//! External codegen infrastructure.
//!
//! A codegen consumes one partitioned function and produces a runtime module
//! exporting that function's global symbol. Codegens register themselves by
//! compiler name; the build pipeline looks them up when it encounters a
//! function claimed by that compiler.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use thiserror::Error;

use crate::ir::Function;
use crate::runtime::RuntimeModule;

#[derive(Debug, Error, Clone)]
#[error("{message}")]
pub struct CodegenError {
    message: String,
}

impl CodegenError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub type CodegenResult<T> = Result<T, CodegenError>;

pub trait ExternalCodegen: Send + Sync {
    /// Compiler identifier, e.g. `"pim"`.
    fn name(&self) -> &str;

    fn version(&self) -> u64 {
        0
    }

    /// Validates that the partitioned function is something this codegen can
    /// actually lower.
    fn check(&self, _function: &Function) -> CodegenResult<()> {
        Ok(())
    }

    fn compile(&self, function: &Function) -> CodegenResult<Arc<dyn RuntimeModule>>;
}

struct CodegenRegistry {
    codegens: RwLock<HashMap<String, Arc<dyn ExternalCodegen>>>,
}

impl CodegenRegistry {
    fn new() -> Self {
        Self {
            codegens: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, codegen: Arc<dyn ExternalCodegen>) {
        self.codegens
            .write()
            .expect("codegen registry poisoned")
            .insert(codegen.name().to_string(), codegen);
    }

    fn get(&self, name: &str) -> Option<Arc<dyn ExternalCodegen>> {
        self.codegens
            .read()
            .expect("codegen registry poisoned")
            .get(name)
            .cloned()
    }

    fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .codegens
            .read()
            .expect("codegen registry poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

static GLOBAL_REGISTRY: OnceLock<CodegenRegistry> = OnceLock::new();

fn registry() -> &'static CodegenRegistry {
    GLOBAL_REGISTRY.get_or_init(CodegenRegistry::new)
}

pub fn register_codegen(codegen: Arc<dyn ExternalCodegen>) {
    registry().register(codegen);
}

pub fn get_codegen(name: &str) -> Option<Arc<dyn ExternalCodegen>> {
    registry().get(name)
}

pub fn list_codegens() -> Vec<String> {
    registry().list()
}
