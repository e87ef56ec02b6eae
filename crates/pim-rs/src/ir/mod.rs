//! Tensor expression IR shared by the partitioner, codegens, and executor.

pub(crate) mod infer;
mod visit;

use std::{collections::BTreeMap, fmt, fs, io, path::Path, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::op::Op;

pub use infer::{infer_expr, infer_module, InferError};
pub use visit::{free_vars, walk_expr, ExprVisitor};

/// Frozen IR version enforced on module load.
pub const IR_VERSION: &str = "pimir.v0.1";

fn default_ir_version() -> String {
    IR_VERSION.to_string()
}

/// Scalar element types carried by tensor specs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    I1,
    Si32,
    F32,
}

impl DType {
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32)
    }

    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::I1 => 1,
            DType::Si32 | DType::F32 => 4,
        }
    }
}

/// Logical tensor shape. All extents are static.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self { dims: dims.into() }
    }

    /// Rank-0 shape used by scalar literals.
    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dims.is_empty() {
            return f.write_str("[]");
        }
        let dims = self
            .dims
            .iter()
            .map(usize::to_string)
            .collect::<Vec<_>>()
            .join("x");
        f.write_str(&dims)
    }
}

/// Tensor metadata coupling dtype and shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: Shape,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }

    pub fn f32(dims: impl Into<Vec<usize>>) -> Self {
        Self::new(DType::F32, Shape::new(dims))
    }

    pub fn element_count(&self) -> usize {
        self.shape.element_count()
    }

    pub fn byte_len(&self) -> usize {
        self.element_count() * self.dtype.size_in_bytes()
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor<{:?} x {}>", self.dtype, self.shape)
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LiteralError {
    #[error("literal dtype {0:?} is not backed by dense f32 storage")]
    UnsupportedDType(DType),
    #[error("literal has {got} values but shape {shape} requires {want}")]
    LengthMismatch { got: usize, want: usize, shape: Shape },
}

/// Dense literal tensor payload. Storage is f32-only, matching the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorLiteral {
    pub spec: TensorSpec,
    pub values: Arc<[f32]>,
}

impl TensorLiteral {
    pub fn new(spec: TensorSpec, values: Arc<[f32]>) -> Result<Self, LiteralError> {
        if spec.dtype != DType::F32 {
            return Err(LiteralError::UnsupportedDType(spec.dtype));
        }
        if values.len() != spec.element_count() {
            return Err(LiteralError::LengthMismatch {
                got: values.len(),
                want: spec.element_count(),
                shape: spec.shape,
            });
        }
        Ok(Self { spec, values })
    }

    pub fn f32(dims: impl Into<Vec<usize>>, values: impl Into<Arc<[f32]>>) -> Result<Self, LiteralError> {
        Self::new(TensorSpec::f32(dims), values.into())
    }

    /// Rank-0 literal holding a single scalar.
    pub fn scalar_f32(value: f32) -> Self {
        Self {
            spec: TensorSpec::new(DType::F32, Shape::scalar()),
            values: Arc::from(vec![value]),
        }
    }
}

/// Named, typed function parameter or free variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Var {
    pub name: Arc<str>,
    pub spec: TensorSpec,
}

impl Var {
    pub fn new(name: impl Into<String>, spec: TensorSpec) -> Self {
        Self {
            name: Arc::<str>::from(name.into()),
            spec,
        }
    }
}

/// Embedded constant expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constant {
    pub value: TensorLiteral,
}

/// Reference to a module-level function.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GlobalVar {
    pub name: Arc<str>,
}

impl GlobalVar {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: Arc::<str>::from(name.into()),
        }
    }
}

/// Call target: a registered operator, a module-level function, or an inline
/// function value (the latter carry external-compiler attributes when built
/// by hand, pre-partitioned).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Callee {
    Op(Op),
    Global(GlobalVar),
    Function(Arc<Function>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub callee: Callee,
    pub args: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Var(Var),
    Constant(Constant),
    Call(Call),
}

impl Expr {
    pub fn var(name: impl Into<String>, spec: TensorSpec) -> Self {
        Expr::Var(Var::new(name, spec))
    }

    pub fn constant(value: TensorLiteral) -> Self {
        Expr::Constant(Constant { value })
    }

    pub fn call(callee: Callee, args: Vec<Expr>) -> Self {
        Expr::Call(Call { callee, args })
    }

    pub fn as_call(&self) -> Option<&Call> {
        match self {
            Expr::Call(call) => Some(call),
            _ => None,
        }
    }
}

/// Function attributes consulted by the partitioner and the build pipeline.
///
/// `compiler` names the external codegen that claims the function body and
/// `global_symbol` is the symbol the produced runtime module exports for it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FnAttrs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_symbol: Option<String>,
}

impl FnAttrs {
    pub fn external(compiler: impl Into<String>, global_symbol: impl Into<String>) -> Self {
        Self {
            compiler: Some(compiler.into()),
            global_symbol: Some(global_symbol.into()),
        }
    }

    pub fn is_external(&self) -> bool {
        self.compiler.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Function {
    pub params: Vec<Var>,
    pub body: Expr,
    #[serde(default)]
    pub attrs: FnAttrs,
}

impl Function {
    pub fn new(params: Vec<Var>, body: Expr) -> Self {
        Self {
            params,
            body,
            attrs: FnAttrs::default(),
        }
    }

    /// Marks the function as owned by an external compiler, the counterpart
    /// of attaching `Compiler` and `global_symbol` attributes by hand.
    pub fn set_external(mut self, compiler: impl Into<String>, symbol: impl Into<String>) -> Self {
        self.attrs = FnAttrs::external(compiler, symbol);
        self
    }
}

pub const MAIN_FN: &str = "main";

/// A named collection of functions with a designated entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    #[serde(default = "default_ir_version")]
    pub ir_version: String,
    pub entry: String,
    functions: BTreeMap<String, Function>,
}

#[derive(Debug, Error)]
pub enum ModuleSerdeError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("module ir version '{found}' does not match expected '{expected}'")]
    VersionMismatch {
        found: String,
        expected: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum ModuleIoError {
    #[error(transparent)]
    Serialization(#[from] ModuleSerdeError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Module {
    pub fn new() -> Self {
        Self {
            ir_version: IR_VERSION.to_string(),
            entry: MAIN_FN.to_string(),
            functions: BTreeMap::new(),
        }
    }

    /// Wraps a bare expression into a module whose `main` takes the
    /// expression's free variables, in first-occurrence order.
    pub fn from_expr(expr: Expr) -> Self {
        let params = free_vars(&expr);
        let mut module = Self::new();
        module.add_function(MAIN_FN, Function::new(params, expr));
        module
    }

    pub fn add_function(&mut self, name: impl Into<String>, function: Function) {
        self.functions.insert(name.into(), function);
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.get(name)
    }

    pub fn entry_function(&self) -> Option<&Function> {
        self.functions.get(&self.entry)
    }

    pub fn functions(&self) -> impl Iterator<Item = (&str, &Function)> {
        self.functions.iter().map(|(name, f)| (name.as_str(), f))
    }

    /// Module-level functions claimed by an external compiler.
    pub fn external_functions(&self) -> impl Iterator<Item = (&str, &Function)> {
        self.functions().filter(|(_, f)| f.attrs.is_external())
    }

    pub fn to_json_string(&self) -> Result<String, ModuleSerdeError> {
        serde_json::to_string_pretty(self).map_err(ModuleSerdeError::from)
    }

    pub fn from_json_str(src: &str) -> Result<Self, ModuleSerdeError> {
        let mut module: Module = serde_json::from_str(src)?;
        module.ir_version = normalize_ir_version(module.ir_version)?;
        Ok(module)
    }

    pub fn to_bincode_bytes(&self) -> Result<Vec<u8>, ModuleSerdeError> {
        bincode::serialize(self).map_err(ModuleSerdeError::from)
    }

    pub fn from_bincode_slice(bytes: &[u8]) -> Result<Self, ModuleSerdeError> {
        let mut module: Module = bincode::deserialize(bytes)?;
        module.ir_version = normalize_ir_version(module.ir_version)?;
        Ok(module)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<(), ModuleIoError> {
        let contents = self.to_json_string()?;
        fs::write(path, contents).map_err(ModuleIoError::from)
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self, ModuleIoError> {
        let contents = fs::read_to_string(path).map_err(ModuleIoError::from)?;
        Module::from_json_str(&contents).map_err(ModuleIoError::from)
    }

    pub fn to_text(&self) -> String {
        format!("{self}")
    }
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_ir_version(version: String) -> Result<String, ModuleSerdeError> {
    if version.is_empty() {
        return Ok(IR_VERSION.to_string());
    }
    if version == IR_VERSION {
        Ok(version)
    } else {
        Err(ModuleSerdeError::VersionMismatch {
            found: version,
            expected: IR_VERSION,
        })
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "module @{} (ir_version = {}) {{",
            self.entry, self.ir_version
        )?;
        for (name, function) in &self.functions {
            fmt_function(name, function, 1, f)?;
        }
        writeln!(f, "}}")
    }
}

fn fmt_function(
    name: &str,
    function: &Function,
    indent: usize,
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    let params = function
        .params
        .iter()
        .map(|p| format!("%{}: {}", p.name, p.spec))
        .collect::<Vec<_>>()
        .join(", ");
    let attrs = format_attrs(&function.attrs);
    write_indent(f, indent)?;
    writeln!(f, "fn @{name}({params}){attrs} {{")?;
    write_indent(f, indent + 1)?;
    writeln!(f, "{}", format_expr(&function.body))?;
    write_indent(f, indent)?;
    writeln!(f, "}}")
}

fn format_attrs(attrs: &FnAttrs) -> String {
    if !attrs.is_external() {
        return String::new();
    }
    let compiler = attrs.compiler.as_deref().unwrap_or("");
    match attrs.global_symbol.as_deref() {
        Some(symbol) => format!(" [compiler={compiler}, global_symbol={symbol}]"),
        None => format!(" [compiler={compiler}]"),
    }
}

fn format_expr(expr: &Expr) -> String {
    match expr {
        Expr::Var(var) => format!("%{}", var.name),
        Expr::Constant(constant) => format!(
            "const(dtype={:?}, shape={})",
            constant.value.spec.dtype, constant.value.spec.shape
        ),
        Expr::Call(call) => {
            let args = call
                .args
                .iter()
                .map(format_expr)
                .collect::<Vec<_>>()
                .join(", ");
            match &call.callee {
                Callee::Op(op) => format!("{}({args})", op.name()),
                Callee::Global(global) => format!("@{}({args})", global.name),
                Callee::Function(function) => {
                    let attrs = format_attrs(&function.attrs);
                    format!("(fn{attrs})({args})")
                }
            }
        }
    }
}

fn write_indent(f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
    for _ in 0..indent {
        f.write_str("  ")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op;

    #[test]
    fn literal_rejects_length_mismatch() {
        let err = TensorLiteral::f32(vec![2, 2], vec![1.0f32; 3]).unwrap_err();
        assert!(matches!(err, LiteralError::LengthMismatch { got: 3, want: 4, .. }));
    }

    #[test]
    fn module_text_rendering() {
        let x = Expr::var("x", TensorSpec::f32(vec![2, 2]));
        let y = Expr::var("y", TensorSpec::f32(vec![2, 2]));
        let module = Module::from_expr(op::add(x, y));
        let text = module.to_text();
        assert!(text.contains("fn @main(%x: tensor<F32 x 2x2>, %y: tensor<F32 x 2x2>)"));
        assert!(text.contains("add(%x, %y)"));
    }

    #[test]
    fn module_json_round_trip() {
        let x = Expr::var("x", TensorSpec::f32(vec![4]));
        let module = Module::from_expr(op::multiply(x.clone(), x));
        let json = module.to_json_string().expect("serialize");
        let back = Module::from_json_str(&json).expect("deserialize");
        assert_eq!(module, back);
    }

    #[test]
    fn spec_byte_len_accounts_for_dtype_width() {
        assert_eq!(TensorSpec::f32(vec![2, 2]).byte_len(), 16);
        assert_eq!(
            TensorSpec::new(DType::I1, Shape::new(vec![8])).byte_len(),
            8
        );
    }

    #[test]
    fn module_bincode_round_trip() {
        let x = Expr::var("x", TensorSpec::f32(vec![2]));
        let y = Expr::var("y", TensorSpec::f32(vec![2]));
        let module = Module::from_expr(op::subtract(x, y));
        let bytes = module.to_bincode_bytes().expect("serialize");
        let back = Module::from_bincode_slice(&bytes).expect("deserialize");
        assert_eq!(module, back);
    }

    #[test]
    fn module_saves_and_loads_json_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("module.json");
        let x = Expr::var("x", TensorSpec::f32(vec![3]));
        let module = Module::from_expr(op::tutorial_add(x, 2.0));
        module.save_json(&path).expect("save");
        let back = Module::load_json(&path).expect("load");
        assert_eq!(module, back);
    }

    #[test]
    fn module_rejects_foreign_ir_version() {
        let x = Expr::var("x", TensorSpec::f32(vec![1]));
        let mut module = Module::from_expr(x);
        module.ir_version = "pimir.v9.9".to_string();
        let json = module.to_json_string().expect("serialize");
        let err = Module::from_json_str(&json).unwrap_err();
        assert!(matches!(err, ModuleSerdeError::VersionMismatch { .. }));
    }
}
