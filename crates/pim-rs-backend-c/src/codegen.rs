//! Postorder C emitter for partitioned elementwise subgraphs.

use pim_rs::codegen::{CodegenError, CodegenResult};
use pim_rs::ir::{Call, Callee, Expr, Function};
use pim_rs::op::{self, ElementwiseBinaryOp, OpKind};

const OPERATOR_MACROS: &str = r#"#define CSOURCE_BINARY_OP_1D(p_ID_, p_OP_, p_DIM1_)               \
  static void p_ID_(const float* a, const float* b, float* out) { \
    for (int64_t i = 0; i < p_DIM1_; ++i) {                       \
      out[i] = a[i] p_OP_ b[i];                                   \
    }                                                             \
  }

#define CSOURCE_BINARY_OP_2D(p_ID_, p_OP_, p_DIM1_, p_DIM2_)      \
  static void p_ID_(const float* a, const float* b, float* out) { \
    for (int64_t i = 0; i < p_DIM1_; ++i) {                       \
      for (int64_t j = 0; j < p_DIM2_; ++j) {                     \
        int64_t k = i * p_DIM2_ + j;                              \
        out[k] = a[k] p_OP_ b[k];                                 \
      }                                                           \
    }                                                             \
  }
"#;

struct Output {
    name: String,
    dims: Vec<usize>,
}

struct CodegenC<'a> {
    symbol: &'a str,
    func_idx: usize,
    buf_idx: usize,
    macro_decls: Vec<String>,
    buf_decls: Vec<String>,
    body: Vec<String>,
}

impl CodegenC<'_> {
    fn visit(&mut self, expr: &Expr) -> CodegenResult<Output> {
        match expr {
            Expr::Var(var) => Ok(Output {
                name: var.name.to_string(),
                dims: var.spec.shape.dims().to_vec(),
            }),
            Expr::Constant(_) => Err(CodegenError::new(
                "constants are lifted to subgraph inputs before codegen",
            )),
            Expr::Call(call) => self.visit_call(call),
        }
    }

    fn visit_call(&mut self, call: &Call) -> CodegenResult<Output> {
        let Callee::Op(op) = &call.callee else {
            return Err(CodegenError::new("subgraph bodies may only call operators"));
        };
        let op_char = operator_char(op.name())?;

        let lhs = self.visit(&call.args[0])?;
        let rhs = self.visit(&call.args[1])?;

        // One macro-generated kernel per call site.
        let func_name = format!("{}_{}", self.symbol, self.func_idx);
        self.func_idx += 1;
        let dims = lhs.dims.clone();
        self.macro_decls.push(match dims.as_slice() {
            [d0] => format!("CSOURCE_BINARY_OP_1D({func_name}, {op_char}, {d0})"),
            [d0, d1] => format!("CSOURCE_BINARY_OP_2D({func_name}, {op_char}, {d0}, {d1})"),
            other => {
                return Err(CodegenError::new(format!(
                    "rank {} tensors are not supported; kernels cover 1-D and 2-D",
                    other.len()
                )))
            }
        });

        let out = format!("buf_{}", self.buf_idx);
        self.buf_idx += 1;
        let size: usize = dims.iter().product();
        self.buf_decls
            .push(format!("float* {out} = (float*)malloc(4 * {size});"));
        self.body
            .push(format!("{func_name}({}, {}, {out});", lhs.name, rhs.name));

        Ok(Output { name: out, dims })
    }
}

fn operator_char(name: &str) -> CodegenResult<char> {
    match op::op_def(name).map(|def| def.kind) {
        Some(OpKind::ElementwiseBinary(ElementwiseBinaryOp::Add)) => Ok('+'),
        Some(OpKind::ElementwiseBinary(ElementwiseBinaryOp::Subtract)) => Ok('-'),
        Some(OpKind::ElementwiseBinary(ElementwiseBinaryOp::Multiply)) => Ok('*'),
        _ => Err(CodegenError::new(format!("unrecognized op '{name}'"))),
    }
}

/// Emits a complete C translation unit for one subgraph function.
pub(crate) fn generate_c_module(function: &Function, symbol: &str) -> CodegenResult<String> {
    let mut builder = CodegenC {
        symbol,
        func_idx: 0,
        buf_idx: 0,
        macro_decls: Vec::new(),
        buf_decls: Vec::new(),
        body: Vec::new(),
    };
    let result = builder.visit(&function.body)?;
    let out_size: usize = result.dims.iter().product();

    let mut code = String::new();
    code.push_str("#include <stdint.h>\n");
    code.push_str("#include <stdlib.h>\n");
    code.push_str("#include <string.h>\n\n");
    code.push_str(OPERATOR_MACROS);
    code.push('\n');
    for decl in &builder.macro_decls {
        code.push_str(decl);
        code.push('\n');
    }
    code.push('\n');

    let params = function
        .params
        .iter()
        .map(|p| format!("const float* {}", p.name))
        .collect::<Vec<_>>()
        .join(", ");
    if params.is_empty() {
        code.push_str(&format!("void {symbol}(float* out) {{\n"));
    } else {
        code.push_str(&format!("void {symbol}({params}, float* out) {{\n"));
    }
    for decl in &builder.buf_decls {
        code.push_str("  ");
        code.push_str(decl);
        code.push('\n');
    }
    for line in &builder.body {
        code.push_str("  ");
        code.push_str(line);
        code.push('\n');
    }
    code.push_str(&format!("  memcpy(out, {}, 4 * {out_size});\n", result.name));
    for idx in 0..builder.buf_idx {
        code.push_str(&format!("  free(buf_{idx});\n"));
    }
    code.push_str("}\n");
    Ok(code)
}
