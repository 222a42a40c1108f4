//! Lowering of foreign lifter output into the IR.
//!
//! Translation is purely structural. The lifter's semantics are reproduced verbatim except for a
//! handful of adjustments:
//!
//! - `x > y` becomes `y <= x`, and `x >= y` becomes `y < x` (operands swapped, not re-evaluated).
//!   All comparisons are unsigned.
//! - The deprecated rotates are rejected; the deprecated float casts are replaced by their operand.
//! - A move into memory becomes an assignment of the memory variable to a `Store`.
//! - A jump immediately followed by `special "call"`/`special "ret"` absorbs the special as a tag.

use crate::ast::{label_to_expr, Expr, Label, Program, Stmt};
use crate::config::CONFIG;
use crate::error::{FastPathError, LowerError, Result};
use crate::foreign::{
    FastLifter, ForeignBinOp, ForeignBlock, ForeignCast, ForeignContext, ForeignExpr, ForeignStmt,
    ForeignUnOp, Lifter,
};
use crate::log::*;
use crate::scope::Scope;
use crate::types::{Attribute, BinOp, CastKind, ConcreteContext, Endian, RegType, TaintState, UnOp};
use crate::variable::Variable;

/// Type used for concrete records that do not state one
pub const DEFAULT_CONCRETE_TYPE: RegType = RegType::Bit32;

/// Special texts that fold into the preceding jump
const FOLDED_SPECIALS: [&str; 2] = ["call", "ret"];

fn lower_binop(op: ForeignBinOp) -> Result<(BinOp, bool)> {
    // The flag says whether operands get swapped
    Ok(match op {
        ForeignBinOp::Plus => (BinOp::Plus, false),
        ForeignBinOp::Minus => (BinOp::Minus, false),
        ForeignBinOp::Times => (BinOp::Times, false),
        ForeignBinOp::Divide => (BinOp::Divide, false),
        ForeignBinOp::Mod => (BinOp::Mod, false),
        ForeignBinOp::LShift => (BinOp::LShift, false),
        ForeignBinOp::RShift => (BinOp::RShift, false),
        ForeignBinOp::ARShift => (BinOp::ARShift, false),
        ForeignBinOp::LRotate | ForeignBinOp::RRotate => {
            return Err(LowerError::UnsupportedOperator(format!(
                "{:?} is deprecated",
                op
            )))
        }
        ForeignBinOp::LogicAnd | ForeignBinOp::BitAnd => (BinOp::And, false),
        ForeignBinOp::LogicOr | ForeignBinOp::BitOr => (BinOp::Or, false),
        ForeignBinOp::Xor => (BinOp::Xor, false),
        ForeignBinOp::Eq => (BinOp::Eq, false),
        ForeignBinOp::Neq => (BinOp::Neq, false),
        ForeignBinOp::Lt => (BinOp::Lt, false),
        ForeignBinOp::Le => (BinOp::Le, false),
        ForeignBinOp::Gt => (BinOp::Le, true),
        ForeignBinOp::Ge => (BinOp::Lt, true),
        ForeignBinOp::SDivide => (BinOp::SDivide, false),
        ForeignBinOp::SMod => (BinOp::SMod, false),
    })
}

fn lower_unop(op: ForeignUnOp) -> UnOp {
    match op {
        ForeignUnOp::Neg => UnOp::Neg,
        ForeignUnOp::Not => UnOp::Not,
    }
}

/// `None` for the legacy float casts, which lower to their operand
fn lower_cast(kind: ForeignCast) -> Option<CastKind> {
    match kind {
        ForeignCast::Unsigned => Some(CastKind::Unsigned),
        ForeignCast::Signed => Some(CastKind::Signed),
        ForeignCast::High => Some(CastKind::High),
        ForeignCast::Low => Some(CastKind::Low),
        ForeignCast::Float | ForeignCast::Integer | ForeignCast::RFloat | ForeignCast::RInteger => {
            None
        }
    }
}

/// Lower a foreign expression.
pub fn lower_expr(scope: &Scope, e: &ForeignExpr) -> Result<Expr> {
    Ok(match e {
        ForeignExpr::BinOp(op, a, b) => {
            let a = lower_expr(scope, a)?;
            let b = lower_expr(scope, b)?;
            let (op, swap) = lower_binop(*op)?;
            let (a, b) = if swap { (b, a) } else { (a, b) };
            Expr::BinOp(op, Box::new(a), Box::new(b))
        }
        ForeignExpr::UnOp(op, a) => Expr::UnOp(lower_unop(*op), Box::new(lower_expr(scope, a)?)),
        ForeignExpr::Constant { value, width } => Expr::Int(*value, RegType::from_bits(*width)?),
        ForeignExpr::Mem { addr, width } => Expr::Load {
            array: Box::new(Expr::var(scope.mem())),
            index: Box::new(lower_expr(scope, addr)?),
            endian: Endian::Little,
            typ: RegType::from_bits(*width)?,
        },
        ForeignExpr::Temp { name, width } => {
            let v = scope.lookup(name)?;
            if cfg!(debug_assertions) && CONFIG.warn_on_temp_width_mismatch {
                check_temp_width(v, *width);
            }
            Expr::var(v)
        }
        ForeignExpr::Cast { kind, width, expr } => {
            let inner = lower_expr(scope, expr)?;
            let typ = RegType::from_bits(*width)?;
            match lower_cast(*kind) {
                Some(k) => Expr::Cast(k, typ, Box::new(inner)),
                None => {
                    trace!("Dropping legacy float cast"; "kind" => ?kind, "width" => width);
                    inner
                }
            }
        }
        ForeignExpr::Name(n) => label_to_expr(&Label::Name(n.clone())),
        ForeignExpr::Unknown { description, width } => {
            Expr::Unknown(description.clone(), RegType::from_bits(*width)?.into())
        }
        ForeignExpr::Let { .. } => {
            return Err(LowerError::UnsupportedConstruct("let expression".into()))
        }
        ForeignExpr::Extension(n) => {
            return Err(LowerError::UnsupportedConstruct(format!(
                "extension expression `{}`",
                n
            )))
        }
    })
}

fn check_temp_width(v: &Variable, width: u32) {
    if v.reg_type().map(RegType::bits) != Some(width) {
        warn!(
            "Temporary used at a width that differs from its declaration";
            "var" => %v,
            "foreign_width" => width,
        );
    }
}

fn lower_context(c: &ForeignContext) -> Result<ConcreteContext> {
    let typ = match c.width {
        Some(w) => RegType::from_bits(w)?,
        None => {
            warn!(
                "Concrete record without a type; defaulting";
                "name" => &c.name,
                "default" => %DEFAULT_CONCRETE_TYPE,
            );
            DEFAULT_CONCRETE_TYPE
        }
    };
    Ok(ConcreteContext {
        name: c.name.clone(),
        is_memory: c.is_memory,
        typ,
        index: c.index,
        value: c.value,
        taint: if c.tainted {
            TaintState::Tainted
        } else {
            TaintState::Untainted
        },
    })
}

/// Lower a foreign statement. Attributes start out empty, except for concrete records on labels.
pub fn lower_stmt(scope: &Scope, s: &ForeignStmt) -> Result<Stmt> {
    Ok(match s {
        ForeignStmt::Jmp(e) => Stmt::Jump(lower_expr(scope, e)?, vec![]),
        ForeignStmt::CJmp(c, t, f) => Stmt::CondJump(
            lower_expr(scope, c)?,
            lower_expr(scope, t)?,
            lower_expr(scope, f)?,
            vec![],
        ),
        ForeignStmt::Special(s) => Stmt::Special(s.clone(), vec![]),
        ForeignStmt::Move(lhs, rhs) => {
            let value = lower_expr(scope, rhs)?;
            match lower_expr(scope, lhs)? {
                Expr::Var(v) => Stmt::Assign(v, value, vec![]),
                Expr::Load {
                    array,
                    index,
                    endian,
                    typ,
                } => Stmt::Assign(
                    scope.mem().clone(),
                    Expr::Store {
                        array,
                        index,
                        value: Box::new(value),
                        endian,
                        typ,
                    },
                    vec![],
                ),
                other => return Err(LowerError::InvalidAssignmentTarget(other.to_string())),
            }
        }
        ForeignStmt::Comment(c) => Stmt::Comment(c.clone(), vec![]),
        ForeignStmt::Label { name, contexts } => Stmt::LabelDef(
            Label::Name(name.clone()),
            contexts
                .iter()
                .map(|c| lower_context(c).map(Attribute::Context))
                .collect::<Result<_>>()?,
        ),
        ForeignStmt::Assert(e) => Stmt::Assert(lower_expr(scope, e)?, vec![]),
        ForeignStmt::VarDecl { name, .. } => {
            return Err(LowerError::UnsupportedConstruct(format!(
                "declaration of `{}` as a statement",
                name
            )))
        }
        ForeignStmt::ExpStmt(_) => {
            return Err(LowerError::UnsupportedConstruct(
                "expression statement".into(),
            ))
        }
        ForeignStmt::Call => return Err(LowerError::UnsupportedConstruct("call".into())),
        ForeignStmt::Return => return Err(LowerError::UnsupportedConstruct("return".into())),
        ForeignStmt::Func(n) => {
            return Err(LowerError::UnsupportedConstruct(format!(
                "function `{}`",
                n
            )))
        }
    })
}

/// Fold `special "call"`/`special "ret"` into an immediately preceding jump as a tag.
pub fn fold_specials(stmts: Vec<Stmt>) -> Vec<Stmt> {
    let mut out: Vec<Stmt> = Vec::with_capacity(stmts.len());
    // A jump absorbs at most one special
    let mut just_folded = false;
    for s in stmts {
        if let (Stmt::Special(text, _), false) = (&s, just_folded) {
            if let Some(Stmt::Jump(_, attrs)) = out.last_mut() {
                if FOLDED_SPECIALS.contains(&text.as_str()) {
                    trace!("Folding special into jump"; "special" => text);
                    attrs.push(Attribute::Tag(text.clone()));
                    just_folded = true;
                    continue;
                }
            }
        }
        just_folded = false;
        out.push(s);
    }
    out
}

/// Split out the block's temporary declarations as fresh variables.
fn extract_decls(stmts: &[ForeignStmt]) -> Result<(Vec<Variable>, Vec<&ForeignStmt>)> {
    let mut decls = vec![];
    let mut rest = vec![];
    for s in stmts {
        match s {
            ForeignStmt::VarDecl { name, width } => {
                decls.push(Variable::new(name.clone(), RegType::from_bits(*width)?))
            }
            s => rest.push(s),
        }
    }
    Ok((decls, rest))
}

/// Lower one foreign block, prefixed with its address label. The block's temporaries are visible
/// only while its statements are lowered; `scope` is unchanged afterwards, on success or failure.
pub fn lower_block(scope: &mut Scope, block: &ForeignBlock, with_text: bool) -> Result<Vec<Stmt>> {
    let (decls, rest) = extract_decls(&block.stmts)?;
    let frame = scope.push_frame(decls);

    let label_attrs = match (&block.disassembly, with_text) {
        (Some(asm), true) => vec![Attribute::Asm(asm.clone())],
        _ => vec![],
    };
    let mut stmts = vec![Stmt::LabelDef(Label::Addr(block.address), label_attrs)];
    for s in rest {
        stmts.push(lower_stmt(&frame, s)?);
    }
    drop(frame);

    debug!(
        "Lowered block";
        "address" => format!("{:#x}", block.address),
        "stmts" => stmts.len(),
    );
    Ok(fold_specials(stmts))
}

/// Lower all blocks in order. Either every block lowers, or the first error is returned.
pub fn lower_program(scope: &mut Scope, blocks: &[ForeignBlock], with_text: bool) -> Result<Program> {
    let mut stmts = vec![];
    for b in blocks {
        stmts.extend(lower_block(scope, b, with_text)?);
    }
    Ok(Program::new(stmts))
}

/// Lower the instruction at `address`: try the fast path, and fall back to the general lifter
/// when the fast path reports it cannot help. Returns the statements and the next address.
pub fn lower_address<F: FastLifter, L: Lifter>(
    scope: &mut Scope,
    fast: &F,
    lifter: &L,
    address: u64,
) -> Result<(Vec<Stmt>, u64)> {
    let reason = match fast.lift_instruction(scope, address) {
        Ok(res) => return Ok(res),
        Err(FastPathError::Unimplemented) => None,
        Err(FastPathError::Transient(reason)) => Some(reason),
    };
    debug!(
        "Fast path declined, falling back";
        "address" => format!("{:#x}", address),
        OptionalKV("reason", reason),
    );
    let block = lifter
        .lift_block(address)
        .map_err(|reason| LowerError::LiftFailure { address, reason })?;
    let stmts = lower_block(scope, &block, CONFIG.attach_disassembly_to_block_labels)?;
    Ok((stmts, block.next_address()))
}

/// Lower every instruction from `start` up to (not including) `end`, one address at a time.
/// Returns the per-instruction fragments in address order.
pub fn lower_range<F: FastLifter, L: Lifter>(
    scope: &mut Scope,
    fast: &F,
    lifter: &L,
    start: u64,
    end: u64,
) -> Result<Vec<Vec<Stmt>>> {
    let mut fragments = vec![];
    let mut address = start;
    while address < end {
        let (stmts, next) = lower_address(scope, fast, lifter, address)?;
        if next <= address {
            return Err(LowerError::NonAdvancingAddress { address, next });
        }
        fragments.push(stmts);
        address = next;
    }
    Ok(fragments)
}
