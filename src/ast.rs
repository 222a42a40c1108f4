//! The nested-expression, flat-statement intermediate representation.
//!
//! Expressions are trees: every child expression is exclusively owned by its parent. The only
//! thing shared between nodes are [`Variable`]s, which are compared by identity.

use crate::types::{Attribute, BinOp, CastKind, Endian, RegType, Type, UnOp};
use crate::variable::Variable;

/// An IR expression
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Expr {
    /// Read a value of type `typ` from `array` at `index`
    Load {
        array: Box<Expr>,
        index: Box<Expr>,
        endian: Endian,
        typ: RegType,
    },
    /// The memory `array` after writing `value` (of type `typ`) at `index`
    Store {
        array: Box<Expr>,
        index: Box<Expr>,
        value: Box<Expr>,
        endian: Endian,
        typ: RegType,
    },
    BinOp(BinOp, Box<Expr>, Box<Expr>),
    UnOp(UnOp, Box<Expr>),
    Var(Variable),
    /// A symbolic code label
    Label(String),
    Int(u64, RegType),
    Cast(CastKind, RegType, Box<Expr>),
    /// `let var = bound in body`. Never produced by lowering.
    Let(Variable, Box<Expr>, Box<Expr>),
    Unknown(String, Type),
}

impl Expr {
    /// The 1-bit constant 0
    pub fn false_() -> Self {
        Expr::Int(0, RegType::Bit1)
    }

    /// The 1-bit constant 1
    pub fn true_() -> Self {
        Expr::Int(1, RegType::Bit1)
    }

    /// Boolean conjunction of two 1-bit expressions
    pub fn and(a: Expr, b: Expr) -> Self {
        Expr::BinOp(BinOp::And, Box::new(a), Box::new(b))
    }

    /// Boolean disjunction of two 1-bit expressions
    pub fn or(a: Expr, b: Expr) -> Self {
        Expr::BinOp(BinOp::Or, Box::new(a), Box::new(b))
    }

    /// Boolean negation of a 1-bit expression
    pub fn not(a: Expr) -> Self {
        Expr::UnOp(UnOp::Not, Box::new(a))
    }

    /// `a => b`, i.e. `~a | b`
    pub fn implies(a: Expr, b: Expr) -> Self {
        Expr::or(Expr::not(a), b)
    }

    pub fn var(v: &Variable) -> Self {
        Expr::Var(v.clone())
    }

    /// The type attached to this expression at construction.
    pub fn typ(&self) -> Type {
        match self {
            Expr::Load { typ, .. } => Type::Reg(*typ),
            Expr::Store { array, .. } => array.typ(),
            Expr::BinOp(op, lhs, _) => {
                if op.is_comparison() {
                    Type::Reg(RegType::Bit1)
                } else {
                    lhs.typ()
                }
            }
            Expr::UnOp(_, e) => e.typ(),
            Expr::Var(v) => v.typ().clone(),
            Expr::Label(_) => Type::Reg(RegType::Bit64),
            Expr::Int(_, t) => Type::Reg(*t),
            Expr::Cast(_, t, _) => Type::Reg(*t),
            Expr::Let(_, _, body) => body.typ(),
            Expr::Unknown(_, t) => t.clone(),
        }
    }
}

/// A jump target: either symbolic or a concrete address.
#[derive(Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum Label {
    Name(String),
    Addr(u64),
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Label::Name(n) => write!(f, "label {}", n),
            Label::Addr(a) => write!(f, "addr {:#x}", a),
        }
    }
}

/// The expression denoting a label. Addresses become 64-bit integer literals.
pub fn label_to_expr(l: &Label) -> Expr {
    match l {
        Label::Name(n) => Expr::Label(n.clone()),
        Label::Addr(a) => Expr::Int(*a, RegType::Bit64),
    }
}

/// The label an expression denotes, if any. Integer literals are masked to their width.
///
/// Note: `label_to_expr(expr_to_label(e))` only gives back `e` for symbolic labels and 64-bit
/// literals; a narrower literal comes back as a 64-bit one.
pub fn expr_to_label(e: &Expr) -> Option<Label> {
    match e {
        Expr::Label(n) => Some(Label::Name(n.clone())),
        Expr::Int(v, t) => Some(Label::Addr(v & t.mask())),
        _ => None,
    }
}

/// An IR statement. Every statement carries its ordered attribute list.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Stmt {
    Assign(Variable, Expr, Vec<Attribute>),
    Jump(Expr, Vec<Attribute>),
    CondJump(Expr, Expr, Expr, Vec<Attribute>),
    LabelDef(Label, Vec<Attribute>),
    Halt(Expr, Vec<Attribute>),
    Assert(Expr, Vec<Attribute>),
    Comment(String, Vec<Attribute>),
    /// An opaque foreign opcode
    Special(String, Vec<Attribute>),
}

impl Stmt {
    pub fn attributes(&self) -> &[Attribute] {
        match self {
            Stmt::Assign(_, _, a)
            | Stmt::Jump(_, a)
            | Stmt::CondJump(_, _, _, a)
            | Stmt::LabelDef(_, a)
            | Stmt::Halt(_, a)
            | Stmt::Assert(_, a)
            | Stmt::Comment(_, a)
            | Stmt::Special(_, a) => a,
        }
    }

    pub fn attributes_mut(&mut self) -> &mut Vec<Attribute> {
        match self {
            Stmt::Assign(_, _, a)
            | Stmt::Jump(_, a)
            | Stmt::CondJump(_, _, _, a)
            | Stmt::LabelDef(_, a)
            | Stmt::Halt(_, a)
            | Stmt::Assert(_, a)
            | Stmt::Comment(_, a)
            | Stmt::Special(_, a) => a,
        }
    }
}

/// A lowered program. Statement order is control-flow significant (fallthrough).
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Program {
    pub stmts: Vec<Stmt>,
}

impl Program {
    pub fn new(stmts: Vec<Stmt>) -> Self {
        Self { stmts }
    }

    pub fn len(&self) -> usize {
        self.stmts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty()
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Expr::Load {
                array,
                index,
                endian,
                typ,
            } => write!(f, "{}[{}, {}]:{}", array, index, endian_str(*endian), typ),
            Expr::Store {
                array,
                index,
                value,
                endian,
                typ,
            } => write!(
                f,
                "{} with [{}, {}]:{} = {}",
                array,
                index,
                endian_str(*endian),
                typ,
                value
            ),
            Expr::BinOp(op, a, b) => write!(f, "({} {} {})", a, op, b),
            Expr::UnOp(op, a) => write!(f, "{}{}", op, a),
            Expr::Var(v) => write!(f, "{}", v),
            Expr::Label(n) => write!(f, "name({})", n),
            Expr::Int(v, t) => {
                if v < &10 {
                    write!(f, "{}:{}", v, t)
                } else {
                    write!(f, "{:#x}:{}", v, t)
                }
            }
            Expr::Cast(k, t, e) => write!(f, "{}:{}({})", k, t, e),
            Expr::Let(v, a, b) => write!(f, "(let {} := {} in {})", v, a, b),
            Expr::Unknown(s, t) => write!(f, "unknown {:?}:{}", s, t),
        }
    }
}

fn endian_str(e: Endian) -> &'static str {
    match e {
        Endian::Little => "e_little",
        Endian::Big => "e_big",
    }
}

impl std::fmt::Display for Stmt {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Stmt::Assign(v, e, _) => write!(f, "{} = {}", v, e)?,
            Stmt::Jump(e, _) => write!(f, "jmp {}", e)?,
            Stmt::CondJump(c, t, e, _) => write!(f, "cjmp {}, {}, {}", c, t, e)?,
            Stmt::LabelDef(l, _) => write!(f, "{}", l)?,
            Stmt::Halt(e, _) => write!(f, "halt {}", e)?,
            Stmt::Assert(e, _) => write!(f, "assert {}", e)?,
            Stmt::Comment(s, _) => write!(f, "/* {} */", s)?,
            Stmt::Special(s, _) => write!(f, "special {:?}", s)?,
        }
        for a in self.attributes() {
            write!(f, " {}", a)?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for s in &self.stmts {
            writeln!(f, "{}", s)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_masking_per_width() {
        let v = 0xdead_beef_cafe_f00d_u64;
        for t in RegType::ALL {
            assert_eq!(
                expr_to_label(&Expr::Int(v, t)),
                Some(Label::Addr(v & t.mask()))
            );
        }
        assert_eq!(
            expr_to_label(&Expr::Int(0b110, RegType::Bit1)),
            Some(Label::Addr(0))
        );
        assert_eq!(
            expr_to_label(&Expr::Int(0x1ff, RegType::Bit8)),
            Some(Label::Addr(0xff))
        );
    }

    #[test]
    fn non_targets_have_no_label() {
        let v = Variable::new("R_EAX", RegType::Bit32);
        assert_eq!(expr_to_label(&Expr::var(&v)), None);
        assert_eq!(expr_to_label(&Expr::not(Expr::true_())), None);
    }

    #[test]
    fn label_round_trip_for_names_and_64_bit_literals() {
        for e in [
            Expr::Label("pc_0x8048000".into()),
            Expr::Int(0x8048000, RegType::Bit64),
            Expr::Int(u64::MAX, RegType::Bit64),
        ] {
            assert_eq!(label_to_expr(&expr_to_label(&e).unwrap()), e);
        }
        // Narrower literals widen to 64 bits
        let narrow = Expr::Int(0x10, RegType::Bit32);
        assert_eq!(
            label_to_expr(&expr_to_label(&narrow).unwrap()),
            Expr::Int(0x10, RegType::Bit64)
        );
    }

    #[test]
    fn boolean_helpers_use_one_bit_literals() {
        assert_eq!(Expr::true_().typ(), Type::Reg(RegType::Bit1));
        assert_eq!(Expr::false_(), Expr::Int(0, RegType::Bit1));
        assert_eq!(
            Expr::implies(Expr::true_(), Expr::false_()),
            Expr::BinOp(
                BinOp::Or,
                Box::new(Expr::UnOp(UnOp::Not, Box::new(Expr::true_()))),
                Box::new(Expr::false_())
            )
        );
        assert_eq!(
            Expr::and(Expr::true_(), Expr::false_()).typ(),
            Type::Reg(RegType::Bit1)
        );
    }

    #[test]
    fn comparisons_are_one_bit() {
        let x = Variable::new("x", RegType::Bit32);
        let lt = Expr::BinOp(
            BinOp::Lt,
            Box::new(Expr::var(&x)),
            Box::new(Expr::Int(3, RegType::Bit32)),
        );
        assert_eq!(lt.typ(), Type::Reg(RegType::Bit1));
        let add = Expr::BinOp(
            BinOp::Plus,
            Box::new(Expr::var(&x)),
            Box::new(Expr::Int(3, RegType::Bit32)),
        );
        assert_eq!(add.typ(), Type::Reg(RegType::Bit32));
    }
}
