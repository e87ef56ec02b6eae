pub mod build;
pub mod codegen;
pub mod ir;
pub mod op;
pub mod partition;
pub mod runtime;

pub use build::{build, build_with_config, Artifact, BuildConfig};
pub use ir::{DType, Module, Shape, TensorSpec};
pub use runtime::{RuntimeModule, Tensor};
