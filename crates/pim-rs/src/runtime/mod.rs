//! Runtime tensors, runtime modules, and the module loader registry.

pub mod interp;

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::{Arc, OnceLock, RwLock};

use thiserror::Error;

use crate::ir::{DType, TensorLiteral, TensorSpec};

pub use interp::{HostModule, Interpreter};

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("unknown subgraph: {0}")]
    UnknownSubgraph(String),
    #[error("unknown op: {0}")]
    UnknownOp(String),
    #[error("unbound variable '%{0}'")]
    UnboundVar(String),
    #[error("expected {want} inputs, got {got}")]
    ArityMismatch { want: usize, got: usize },
    #[error("input {index} has spec {got}, expected {want}")]
    InputSpecMismatch {
        index: usize,
        got: TensorSpec,
        want: TensorSpec,
    },
    #[error("operand specs {lhs} and {rhs} do not match")]
    SpecMismatch { lhs: TensorSpec, rhs: TensorSpec },
    #[error("tensor dtype {0:?} is not executable; runtime storage is f32")]
    DTypeNotSupported(DType),
    #[error("tensor has {got} values but its spec requires {want}")]
    LengthMismatch { got: usize, want: usize },
    #[error("external function '{0}' is not executable in this artifact")]
    MissingExternal(String),
    #[error("no module loader registered for type key '{0}'")]
    UnknownLoader(String),
    #[error("{what} is not implemented: {reason}")]
    Unimplemented { what: &'static str, reason: String },
    #[error("execution failure: {0}")]
    Execution(String),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

impl RuntimeError {
    pub fn unimplemented(what: &'static str, reason: impl Into<String>) -> Self {
        RuntimeError::Unimplemented {
            what,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        RuntimeError::Execution(message.into())
    }
}

/// Dense runtime tensor. Storage is f32, matching the literal model.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    spec: TensorSpec,
    data: Arc<[f32]>,
}

impl Tensor {
    pub fn new(spec: TensorSpec, data: impl Into<Arc<[f32]>>) -> RuntimeResult<Self> {
        if spec.dtype != DType::F32 {
            return Err(RuntimeError::DTypeNotSupported(spec.dtype));
        }
        let data = data.into();
        if data.len() != spec.element_count() {
            return Err(RuntimeError::LengthMismatch {
                got: data.len(),
                want: spec.element_count(),
            });
        }
        Ok(Self { spec, data })
    }

    pub fn from_values(
        dims: impl Into<Vec<usize>>,
        values: impl Into<Arc<[f32]>>,
    ) -> RuntimeResult<Self> {
        Self::new(TensorSpec::f32(dims), values)
    }

    pub fn from_literal(literal: &TensorLiteral) -> Self {
        // Literals are validated against f32 storage on construction.
        Self {
            spec: literal.spec.clone(),
            data: literal.values.clone(),
        }
    }

    pub fn zeroed(spec: TensorSpec) -> RuntimeResult<Self> {
        let count = spec.element_count();
        Self::new(spec, vec![0.0f32; count])
    }

    pub fn spec(&self) -> &TensorSpec {
        &self.spec
    }

    pub fn values(&self) -> &[f32] {
        &self.data
    }

    pub fn scalar(&self) -> Option<f32> {
        (self.spec.shape.rank() == 0).then(|| self.data[0])
    }
}

/// Callable exported by a runtime module.
pub type PackedFn = Arc<dyn Fn(&[Tensor]) -> RuntimeResult<Tensor> + Send + Sync>;

/// A compiled module produced by the build pipeline or an external codegen.
pub trait RuntimeModule: Send + Sync {
    /// Stable module kind identifier, e.g. `"examplejson"`.
    fn type_key(&self) -> &str;

    /// Looks up an exported function by symbol.
    fn get_function(&self, name: &str) -> Option<PackedFn>;

    /// Human-readable source in the requested format, when the module
    /// carries one.
    fn source(&self, _format: &str) -> Option<String> {
        None
    }

    /// Serializes the module for later reload through a registered loader.
    fn save_to_bytes(&self) -> RuntimeResult<Vec<u8>>;
}

impl std::fmt::Debug for dyn RuntimeModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeModule")
            .field("type_key", &self.type_key())
            .finish()
    }
}

/// Deserializer reconstructing a module from `save_to_bytes` output.
pub type ModuleLoader =
    Arc<dyn Fn(&[u8]) -> RuntimeResult<Arc<dyn RuntimeModule>> + Send + Sync>;

struct LoaderRegistry {
    loaders: RwLock<HashMap<String, ModuleLoader>>,
}

impl LoaderRegistry {
    fn new() -> Self {
        Self {
            loaders: RwLock::new(HashMap::new()),
        }
    }

    fn register(&self, type_key: String, loader: ModuleLoader) {
        self.loaders
            .write()
            .expect("module loader registry poisoned")
            .insert(type_key, loader);
    }

    fn get(&self, type_key: &str) -> Option<ModuleLoader> {
        self.loaders
            .read()
            .expect("module loader registry poisoned")
            .get(type_key)
            .cloned()
    }

    fn list(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .loaders
            .read()
            .expect("module loader registry poisoned")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

static GLOBAL_LOADERS: OnceLock<LoaderRegistry> = OnceLock::new();

fn loaders() -> &'static LoaderRegistry {
    GLOBAL_LOADERS.get_or_init(LoaderRegistry::new)
}

pub fn register_module_loader(type_key: impl Into<String>, loader: ModuleLoader) {
    loaders().register(type_key.into(), loader);
}

pub fn load_module_from_bytes(
    type_key: &str,
    bytes: &[u8],
) -> RuntimeResult<Arc<dyn RuntimeModule>> {
    let loader = loaders()
        .get(type_key)
        .ok_or_else(|| RuntimeError::UnknownLoader(type_key.to_string()))?;
    loader(bytes)
}

pub fn load_module_from_file<P: AsRef<Path>>(
    type_key: &str,
    path: P,
) -> RuntimeResult<Arc<dyn RuntimeModule>> {
    let bytes = std::fs::read(path)?;
    load_module_from_bytes(type_key, &bytes)
}

pub fn list_module_loaders() -> Vec<String> {
    loaders().list()
}
