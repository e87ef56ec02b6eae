//! Operator descriptors and the global operator registry.
//!
//! The registry owns one record per operator name. Besides the operator
//! definition itself, each record carries a keyed attribute map; external
//! backends publish per-target support predicates there under
//! `target.<compiler>` keys, and the partitioner consults them when deciding
//! what to offload. Attribute absence is observable and distinct from a
//! predicate that answers `false`.

pub mod contrib;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ir::{Call, Callee, Expr, TensorLiteral};

/// Elementwise binary operator families known to the host framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementwiseBinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Maximum,
    Minimum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    ElementwiseBinary(ElementwiseBinaryOp),
    /// Tensor plus scalar constant, the tutorial operator.
    TutorialAdd,
}

/// Operator definition as stored in the registry.
#[derive(Debug, Clone)]
pub struct OpDef {
    pub name: &'static str,
    pub kind: OpKind,
}

/// Interned operator reference used as a call target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Op {
    name: Arc<str>,
}

impl Op {
    /// Looks the operator up in the registry; unknown names are an error
    /// here, not at call-construction sites downstream.
    pub fn get(name: &str) -> Result<Self, OpError> {
        if op_def(name).is_none() {
            return Err(OpError::UnknownOp(name.to_string()));
        }
        Ok(Self {
            name: Arc::<str>::from(name),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OpError {
    #[error("operator '{0}' is not registered")]
    UnknownOp(String),
    #[error("operator '{0}' is already registered")]
    DuplicateOp(String),
}

/// Predicate deciding whether a target can take a given operator call.
pub type SupportPredicate = Arc<dyn Fn(&Call) -> bool + Send + Sync>;

/// Attribute value attached to an operator record.
#[derive(Clone)]
pub enum OpAttr {
    TargetPredicate(SupportPredicate),
}

impl fmt::Debug for OpAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpAttr::TargetPredicate(_) => f.write_str("TargetPredicate(..)"),
        }
    }
}

struct OpRecord {
    def: OpDef,
    attrs: HashMap<String, OpAttr>,
}

struct OpRegistry {
    ops: RwLock<HashMap<String, OpRecord>>,
}

impl OpRegistry {
    fn with_builtins() -> Self {
        let registry = Self {
            ops: RwLock::new(HashMap::new()),
        };
        for def in BUILTIN_OPS {
            registry
                .insert(def.clone())
                .expect("builtin operator names are unique");
        }
        registry
    }

    fn insert(&self, def: OpDef) -> Result<(), OpError> {
        let mut ops = self.ops.write().expect("op registry poisoned");
        if ops.contains_key(def.name) {
            return Err(OpError::DuplicateOp(def.name.to_string()));
        }
        ops.insert(
            def.name.to_string(),
            OpRecord {
                def,
                attrs: HashMap::new(),
            },
        );
        Ok(())
    }

    fn def(&self, name: &str) -> Option<OpDef> {
        self.ops
            .read()
            .expect("op registry poisoned")
            .get(name)
            .map(|record| record.def.clone())
    }

    fn set_attr(&self, name: &str, key: &str, attr: OpAttr) -> Result<(), OpError> {
        let mut ops = self.ops.write().expect("op registry poisoned");
        let record = ops
            .get_mut(name)
            .ok_or_else(|| OpError::UnknownOp(name.to_string()))?;
        record.attrs.insert(key.to_string(), attr);
        Ok(())
    }

    fn attr(&self, name: &str, key: &str) -> Option<OpAttr> {
        self.ops
            .read()
            .expect("op registry poisoned")
            .get(name)
            .and_then(|record| record.attrs.get(key).cloned())
    }

    fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .ops
            .read()
            .expect("op registry poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

const BUILTIN_OPS: &[OpDef] = &[
    OpDef {
        name: "add",
        kind: OpKind::ElementwiseBinary(ElementwiseBinaryOp::Add),
    },
    OpDef {
        name: "subtract",
        kind: OpKind::ElementwiseBinary(ElementwiseBinaryOp::Subtract),
    },
    OpDef {
        name: "multiply",
        kind: OpKind::ElementwiseBinary(ElementwiseBinaryOp::Multiply),
    },
    OpDef {
        name: "divide",
        kind: OpKind::ElementwiseBinary(ElementwiseBinaryOp::Divide),
    },
    OpDef {
        name: "maximum",
        kind: OpKind::ElementwiseBinary(ElementwiseBinaryOp::Maximum),
    },
    OpDef {
        name: "minimum",
        kind: OpKind::ElementwiseBinary(ElementwiseBinaryOp::Minimum),
    },
    OpDef {
        name: "tutorial_add",
        kind: OpKind::TutorialAdd,
    },
];

static GLOBAL_REGISTRY: OnceLock<OpRegistry> = OnceLock::new();

fn registry() -> &'static OpRegistry {
    GLOBAL_REGISTRY.get_or_init(OpRegistry::with_builtins)
}

/// Register an additional operator definition.
pub fn register_op(def: OpDef) -> Result<(), OpError> {
    registry().insert(def)
}

pub fn op_def(name: &str) -> Option<OpDef> {
    registry().def(name)
}

pub fn list_ops() -> Vec<String> {
    registry().list()
}

/// Install `attr` under `key` for the named operator. Unknown operator names
/// fail inside the registry.
pub fn register_op_attr(name: &str, key: &str, attr: OpAttr) -> Result<(), OpError> {
    registry().set_attr(name, key, attr)
}

/// Attribute lookup. `None` means the attribute was never installed.
pub fn op_attr(name: &str, key: &str) -> Option<OpAttr> {
    registry().attr(name, key)
}

/// Attribute key under which a compiler's support predicate lives.
pub fn target_key(compiler: &str) -> String {
    format!("target.{compiler}")
}

pub fn target_predicate(name: &str, compiler: &str) -> Option<SupportPredicate> {
    match op_attr(name, &target_key(compiler)) {
        Some(OpAttr::TargetPredicate(predicate)) => Some(predicate),
        None => None,
    }
}

/// Whether `compiler` claims the given call. Calls to globals or inline
/// functions are never claimed here; only operator calls carry target
/// attributes.
pub fn is_call_supported(call: &Call, compiler: &str) -> bool {
    let Callee::Op(op) = &call.callee else {
        return false;
    };
    match target_predicate(op.name(), compiler) {
        Some(predicate) => predicate(call),
        None => false,
    }
}

fn builtin(name: &'static str) -> Op {
    Op::get(name).expect("builtin operator is registered")
}

fn binary(name: &'static str, lhs: Expr, rhs: Expr) -> Expr {
    Expr::call(Callee::Op(builtin(name)), vec![lhs, rhs])
}

pub fn add(lhs: Expr, rhs: Expr) -> Expr {
    binary("add", lhs, rhs)
}

pub fn subtract(lhs: Expr, rhs: Expr) -> Expr {
    binary("subtract", lhs, rhs)
}

pub fn multiply(lhs: Expr, rhs: Expr) -> Expr {
    binary("multiply", lhs, rhs)
}

pub fn divide(lhs: Expr, rhs: Expr) -> Expr {
    binary("divide", lhs, rhs)
}

pub fn maximum(lhs: Expr, rhs: Expr) -> Expr {
    binary("maximum", lhs, rhs)
}

pub fn minimum(lhs: Expr, rhs: Expr) -> Expr {
    binary("minimum", lhs, rhs)
}

/// `tutorial_add(data, alpha)`: adds a scalar constant to every element.
pub fn tutorial_add(data: Expr, alpha: f32) -> Expr {
    Expr::call(
        Callee::Op(builtin("tutorial_add")),
        vec![data, Expr::constant(TensorLiteral::scalar_f32(alpha))],
    )
}
