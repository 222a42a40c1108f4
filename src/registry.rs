//! Per-architecture register variables.
//!
//! Register variables are long-lived: each architecture gets one set, built on first use, and every
//! translation for that architecture shares it. Lowering never reaches for these directly; callers
//! inject them through [`Scope`].

use crate::scope::Scope;
use crate::types::{RegType, Type};
use crate::variable::Variable;

/// Architectures whose registers are known
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum Arch {
    X86,
    Arm,
}

impl std::str::FromStr for Arch {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x86" | "i386" => Ok(Arch::X86),
            "arm" => Ok(Arch::Arm),
            _ => Err(format!("unknown architecture {:?}", s)),
        }
    }
}

/// The registers and memory variable of one architecture
pub struct ArchRegisters {
    pub registers: Vec<Variable>,
    pub memory: Variable,
}

impl ArchRegisters {
    fn build(regs: &[(&str, RegType)], addr: RegType) -> Self {
        Self {
            registers: regs
                .iter()
                .map(|(name, t)| Variable::new(*name, *t))
                .collect(),
            memory: Variable::new("mem", Type::Memory { addr }),
        }
    }
}

const X86_REGISTERS: &[(&str, RegType)] = &[
    ("R_EBP", RegType::Bit32),
    ("R_ESP", RegType::Bit32),
    ("R_ESI", RegType::Bit32),
    ("R_EDI", RegType::Bit32),
    ("R_EIP", RegType::Bit32),
    ("R_EAX", RegType::Bit32),
    ("R_EBX", RegType::Bit32),
    ("R_ECX", RegType::Bit32),
    ("R_EDX", RegType::Bit32),
    ("EFLAGS", RegType::Bit32),
    ("R_CF", RegType::Bit1),
    ("R_PF", RegType::Bit1),
    ("R_AF", RegType::Bit1),
    ("R_ZF", RegType::Bit1),
    ("R_SF", RegType::Bit1),
    ("R_OF", RegType::Bit1),
    ("R_CC_OP", RegType::Bit32),
    ("R_CC_DEP1", RegType::Bit32),
    ("R_CC_DEP2", RegType::Bit32),
    ("R_CC_NDEP", RegType::Bit32),
    ("R_DFLAG", RegType::Bit32),
    ("R_IDFLAG", RegType::Bit32),
    ("R_ACFLAG", RegType::Bit32),
    ("R_EMWARN", RegType::Bit32),
    ("R_LDT", RegType::Bit32),
    ("R_GDT", RegType::Bit32),
    ("R_CS", RegType::Bit16),
    ("R_DS", RegType::Bit16),
    ("R_ES", RegType::Bit16),
    ("R_FS", RegType::Bit16),
    ("R_GS", RegType::Bit16),
    ("R_SS", RegType::Bit16),
    ("R_FTOP", RegType::Bit32),
    ("R_FPROUND", RegType::Bit32),
    ("R_FC3210", RegType::Bit32),
    ("R_SSEROUND", RegType::Bit32),
    ("R_IP_AT_SYSCALL", RegType::Bit32),
];

const ARM_REGISTERS: &[(&str, RegType)] = &[
    ("R0", RegType::Bit32),
    ("R1", RegType::Bit32),
    ("R2", RegType::Bit32),
    ("R3", RegType::Bit32),
    ("R4", RegType::Bit32),
    ("R5", RegType::Bit32),
    ("R6", RegType::Bit32),
    ("R7", RegType::Bit32),
    ("R8", RegType::Bit32),
    ("R9", RegType::Bit32),
    ("R10", RegType::Bit32),
    ("R11", RegType::Bit32),
    ("R12", RegType::Bit32),
    ("R13", RegType::Bit32),
    ("R14", RegType::Bit32),
    ("R15T", RegType::Bit32),
    ("R_CC_OP", RegType::Bit32),
    ("R_CC_DEP1", RegType::Bit32),
    ("R_CC_DEP2", RegType::Bit32),
    ("R_CC_NDEP", RegType::Bit32),
];

lazy_static::lazy_static! {
    static ref X86: ArchRegisters = ArchRegisters::build(X86_REGISTERS, RegType::Bit32);
    static ref ARM: ArchRegisters = ArchRegisters::build(ARM_REGISTERS, RegType::Bit32);
}

/// The shared register set of `arch`
pub fn registers(arch: Arch) -> &'static ArchRegisters {
    match arch {
        Arch::X86 => &X86,
        Arch::Arm => &ARM,
    }
}

/// The shared memory variable of `arch`
pub fn memory(arch: Arch) -> &'static Variable {
    &registers(arch).memory
}

impl Scope {
    /// A fresh translation-unit scope seeded with `arch`'s registers and memory variable
    pub fn for_arch(arch: Arch) -> Self {
        let regs = registers(arch);
        Scope::new(regs.memory.clone(), regs.registers.iter().cloned())
    }
}
