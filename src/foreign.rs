//! The boundary with the external disassembler/lifter.
//!
//! The lifter hands over per-block statement and expression trees with a small closed set of node
//! kinds. Widths are in bits. Nothing here is interpreted; see [`crate::lower`] for that.

use crate::ast::Stmt;
use crate::error::{FastPathError, LowerError, Result};
use crate::log::*;
use crate::scope::Scope;

/// Foreign binary operators
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ForeignBinOp {
    Plus,
    Minus,
    Times,
    Divide,
    Mod,
    LShift,
    RShift,
    ARShift,
    /// Deprecated
    LRotate,
    /// Deprecated
    RRotate,
    LogicAnd,
    LogicOr,
    BitAnd,
    BitOr,
    Xor,
    Eq,
    Neq,
    Gt,
    Lt,
    Ge,
    Le,
    SDivide,
    SMod,
}

/// Foreign unary operators
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ForeignUnOp {
    Neg,
    Not,
}

/// Foreign cast kinds. The last four are legacy float casts.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ForeignCast {
    Unsigned,
    Signed,
    High,
    Low,
    Float,
    Integer,
    RFloat,
    RInteger,
}

/// A foreign expression tree
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ForeignExpr {
    BinOp(ForeignBinOp, Box<ForeignExpr>, Box<ForeignExpr>),
    UnOp(ForeignUnOp, Box<ForeignExpr>),
    Constant {
        value: u64,
        width: u32,
    },
    /// A memory read of `width` bits at `addr`
    Mem {
        addr: Box<ForeignExpr>,
        width: u32,
    },
    /// A named temporary or register
    Temp {
        name: String,
        width: u32,
    },
    Cast {
        kind: ForeignCast,
        width: u32,
        expr: Box<ForeignExpr>,
    },
    /// A symbolic code location
    Name(String),
    Unknown {
        description: String,
        width: u32,
    },
    Let {
        var: Box<ForeignExpr>,
        bound: Box<ForeignExpr>,
        body: Box<ForeignExpr>,
    },
    /// A lifter extension node
    Extension(String),
}

/// A concrete-execution record the lifter attached to a label
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ForeignContext {
    pub name: String,
    pub is_memory: bool,
    /// Legacy producers leave this out
    pub width: Option<u32>,
    pub index: u64,
    pub value: u64,
    pub tainted: bool,
}

/// A foreign statement
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ForeignStmt {
    Jmp(ForeignExpr),
    CJmp(ForeignExpr, ForeignExpr, ForeignExpr),
    Special(String),
    Move(ForeignExpr, ForeignExpr),
    Comment(String),
    Label {
        name: String,
        contexts: Vec<ForeignContext>,
    },
    Assert(ForeignExpr),
    /// Declaration of a block-local temporary
    VarDecl {
        name: String,
        width: u32,
    },
    ExpStmt(ForeignExpr),
    Call,
    Return,
    Func(String),
}

/// The lifted form of one instruction (or basic block) at `address`.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ForeignBlock {
    pub address: u64,
    /// Length in bytes of the underlying machine code
    pub length: u64,
    pub disassembly: Option<String>,
    pub stmts: Vec<ForeignStmt>,
}

impl ForeignBlock {
    /// The address right after this block
    pub fn next_address(&self) -> u64 {
        self.address.wrapping_add(self.length)
    }
}

/// The general lifting path: an external lifter producing foreign blocks.
pub trait Lifter {
    /// Lift the block starting at `address`
    fn lift_block(&self, address: u64) -> std::result::Result<ForeignBlock, String>;
    /// Every block of the binary, in address order
    fn blocks(&self) -> std::result::Result<Vec<ForeignBlock>, String>;
    /// Free whatever the lifter holds. Called exactly once by [`LifterHandle`].
    fn release(&mut self);
}

/// The fast path: a simple per-instruction lowering directly into the IR.
pub trait FastLifter {
    /// Lower the instruction at `address`, returning its statements and the next address.
    fn lift_instruction(
        &self,
        scope: &mut Scope,
        address: u64,
    ) -> std::result::Result<(Vec<Stmt>, u64), FastPathError>;
}

/// A fast path that never handles anything, sending every address to the general path.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoFastPath;

impl FastLifter for NoFastPath {
    fn lift_instruction(
        &self,
        _scope: &mut Scope,
        _address: u64,
    ) -> std::result::Result<(Vec<Stmt>, u64), FastPathError> {
        Err(FastPathError::Unimplemented)
    }
}

/// Exclusive owner of a [`Lifter`]. The lifter is released exactly once: by [`Self::release`] or,
/// failing that, when the handle is dropped.
pub struct LifterHandle<L: Lifter> {
    lifter: Option<L>,
}

impl<L: Lifter> LifterHandle<L> {
    pub fn open(lifter: L) -> Self {
        Self {
            lifter: Some(lifter),
        }
    }

    /// The live lifter
    pub fn get(&self) -> Result<&L> {
        self.lifter.as_ref().ok_or(LowerError::LifterReleased)
    }

    /// Release the lifter now. Releasing again is a no-op.
    pub fn release(&mut self) {
        if let Some(mut l) = self.lifter.take() {
            l.release();
            debug!("Released lifter");
        }
    }

    pub fn is_released(&self) -> bool {
        self.lifter.is_none()
    }
}

impl<L: Lifter> Drop for LifterHandle<L> {
    fn drop(&mut self) {
        self.release();
    }
}
