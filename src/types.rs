//! Type tags, operator tags, and statement attributes of the IR.

use crate::error::{LowerError, Result};

/// A fixed-width integer register type. Booleans are [`RegType::Bit1`] holding 0 or 1.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum RegType {
    Bit1,
    Bit8,
    Bit16,
    Bit32,
    Bit64,
}

impl RegType {
    /// All register types, narrowest first
    pub const ALL: [RegType; 5] = [
        RegType::Bit1,
        RegType::Bit8,
        RegType::Bit16,
        RegType::Bit32,
        RegType::Bit64,
    ];

    /// Width in bits
    pub fn bits(self) -> u32 {
        match self {
            RegType::Bit1 => 1,
            RegType::Bit8 => 8,
            RegType::Bit16 => 16,
            RegType::Bit32 => 32,
            RegType::Bit64 => 64,
        }
    }

    /// A mask that keeps exactly the low [`Self::bits`] bits of a `u64`.
    pub fn mask(self) -> u64 {
        match self {
            RegType::Bit64 => u64::MAX,
            t => (1u64 << t.bits()) - 1,
        }
    }

    /// The register type of a foreign width tag. Only 1, 8, 16, 32 and 64 are valid.
    pub fn from_bits(bits: u32) -> Result<Self> {
        Ok(match bits {
            1 => RegType::Bit1,
            8 => RegType::Bit8,
            16 => RegType::Bit16,
            32 => RegType::Bit32,
            64 => RegType::Bit64,
            _ => return Err(LowerError::UnsupportedWidth(bits)),
        })
    }
}

impl std::fmt::Display for RegType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "u{}", self.bits())
    }
}

/// The type of an IR value.
#[derive(Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum Type {
    /// A fixed-width register value
    Reg(RegType),
    /// A byte-addressed memory array indexed by addresses of type `addr`
    Memory { addr: RegType },
    /// Anything else; carried through opaquely
    Other(String),
}

impl Type {
    /// The register type, if this is a register
    pub fn reg(&self) -> Option<RegType> {
        match self {
            Type::Reg(r) => Some(*r),
            Type::Memory { .. } | Type::Other(_) => None,
        }
    }
}

impl From<RegType> for Type {
    fn from(r: RegType) -> Self {
        Type::Reg(r)
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Type::Reg(r) => write!(f, "{}", r),
            Type::Memory { addr } => write!(f, "?{}", addr),
            Type::Other(s) => write!(f, "<{}>", s),
        }
    }
}

/// Byte order of a memory access
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Endian {
    Big,
    Little,
}

/// Binary operators. All comparisons except [`BinOp::SLt`] and [`BinOp::SLe`] are unsigned.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum BinOp {
    Plus,
    Minus,
    Times,
    /// Unsigned division
    Divide,
    SDivide,
    /// Unsigned remainder
    Mod,
    SMod,
    LShift,
    /// Logical right shift
    RShift,
    /// Arithmetic right shift
    ARShift,
    And,
    Or,
    Xor,
    Eq,
    Neq,
    Lt,
    Le,
    SLt,
    SLe,
}

impl BinOp {
    /// Whether the operator produces a boolean ([`RegType::Bit1`])
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Neq | BinOp::Lt | BinOp::Le | BinOp::SLt | BinOp::SLe
        )
    }

    fn symbol(self) -> &'static str {
        match self {
            BinOp::Plus => "+",
            BinOp::Minus => "-",
            BinOp::Times => "*",
            BinOp::Divide => "/",
            BinOp::SDivide => "$/",
            BinOp::Mod => "%",
            BinOp::SMod => "$%",
            BinOp::LShift => "<<",
            BinOp::RShift => ">>",
            BinOp::ARShift => "$>>",
            BinOp::And => "&",
            BinOp::Or => "|",
            BinOp::Xor => "^",
            BinOp::Eq => "==",
            BinOp::Neq => "<>",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::SLt => "$<",
            BinOp::SLe => "$<=",
        }
    }
}

impl std::fmt::Display for BinOp {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Unary operators
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum UnOp {
    /// Two's complement negation
    Neg,
    /// Bitwise complement
    Not,
}

impl std::fmt::Display for UnOp {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            UnOp::Neg => f.write_str("-"),
            UnOp::Not => f.write_str("~"),
        }
    }
}

/// How a [`crate::ast::Expr::Cast`] changes the width of its operand
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum CastKind {
    /// Zero-extend
    Unsigned,
    /// Sign-extend
    Signed,
    /// Keep the most significant bits
    High,
    /// Keep the least significant bits
    Low,
}

impl std::fmt::Display for CastKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(match self {
            CastKind::Unsigned => "pad",
            CastKind::Signed => "extend",
            CastKind::High => "high",
            CastKind::Low => "low",
        })
    }
}

/// Whether a concretely observed value carried taint
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TaintState {
    Untainted,
    Tainted,
}

/// A value observed during a concrete (traced) execution, attached to label statements.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ConcreteContext {
    /// Register name, or the memory variable's name for memory operands
    pub name: String,
    pub is_memory: bool,
    pub typ: RegType,
    /// Memory address for memory operands; unused otherwise
    pub index: u64,
    pub value: u64,
    pub taint: TaintState,
}

/// Metadata attached to a statement. Order of attributes is insertion order and is significant.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Attribute {
    /// The disassembly text of the instruction a statement came from
    Asm(String),
    /// A free-text tag, e.g. `"call"` or `"ret"` on a folded jump
    Tag(String),
    /// A concrete execution record
    Context(ConcreteContext),
    /// The statement initializes read-only data
    InitReadOnly,
}

impl std::fmt::Display for Attribute {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Attribute::Asm(s) => write!(f, "@asm {:?}", s),
            Attribute::Tag(s) => write!(f, "@str {:?}", s),
            Attribute::Context(c) => write!(
                f,
                "@context {:?}{} = {:#x}:{} ({})",
                c.name,
                if c.is_memory {
                    format!("[{:#x}]", c.index)
                } else {
                    String::new()
                },
                c.value,
                c.typ,
                match c.taint {
                    TaintState::Untainted => "untainted",
                    TaintState::Tainted => "tainted",
                },
            ),
            Attribute::InitReadOnly => write!(f, "@init_ro"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_table_is_a_bijection() {
        for t in RegType::ALL {
            assert_eq!(RegType::from_bits(t.bits()), Ok(t));
        }
        for bits in [0, 2, 7, 24, 128] {
            assert_eq!(
                RegType::from_bits(bits),
                Err(LowerError::UnsupportedWidth(bits))
            );
        }
    }

    #[test]
    fn masks_keep_exactly_the_width() {
        assert_eq!(RegType::Bit1.mask(), 1);
        assert_eq!(RegType::Bit8.mask(), 0xff);
        assert_eq!(RegType::Bit16.mask(), 0xffff);
        assert_eq!(RegType::Bit32.mask(), 0xffff_ffff);
        assert_eq!(RegType::Bit64.mask(), u64::MAX);
    }
}
