//! Turning a binary's sections and symbols into IR-level facts: explicit stores for statically
//! initialized read-only data, and named function address ranges.

use crate::ast::{Expr, Program, Stmt};
use crate::error::{LowerError, Result};
use crate::log::*;
use crate::types::{Attribute, Endian, RegType};
use crate::variable::Variable;
use itertools::Itertools;
use std::sync::Arc;

/// Symbol whose range is never reported as a function
pub const RUNTIME_INIT_SYMBOL: &str = "_init";

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct SectionFlags {
    /// Occupies memory when the binary is loaded
    pub loaded: bool,
    pub read_only: bool,
    pub code: bool,
}

/// One section of a binary, with its contents
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Section {
    pub name: String,
    pub address: u64,
    pub flags: SectionFlags,
    pub bytes: Vec<u8>,
}

impl Section {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.address && address - self.address < self.bytes.len() as u64
    }
}

/// One entry of a binary's symbol table
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Symbol {
    pub name: String,
    /// Offset from `section_base`
    pub value: u64,
    pub is_function: bool,
    pub section_base: u64,
    pub section_size: u64,
}

/// The external binary reader
pub trait BinaryImage {
    fn sections(&self) -> std::result::Result<Vec<Section>, String>;
    fn symbols(&self) -> std::result::Result<Vec<Symbol>, String>;
}

/// An immutable copy of every section of an image, taken once and shared by reference count.
/// Lookups never mutate, so any number of readers may query it concurrently.
#[derive(Clone, Debug)]
pub struct SectionSnapshot {
    sections: Arc<[Section]>,
}

impl SectionSnapshot {
    pub fn take(image: &impl BinaryImage) -> Result<Self> {
        let sections = image.sections().map_err(LowerError::SectionReadFailure)?;
        debug!("Took section snapshot"; "sections" => sections.len());
        Ok(Self {
            sections: sections.into(),
        })
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// The byte at `address`, from the first section that covers it
    pub fn byte_at(&self, address: u64) -> Option<u8> {
        self.sections
            .iter()
            .find(|s| s.contains(address))
            .map(|s| s.bytes[(address - s.address) as usize])
    }

    /// Every `(address, byte)` of the loaded, read-only, non-code sections, in section order
    pub fn read_only_bytes(&self) -> Vec<(u64, u8)> {
        self.sections
            .iter()
            .filter(|s| s.flags.loaded && s.flags.read_only && !s.flags.code)
            .flat_map(|s| {
                s.bytes
                    .iter()
                    .enumerate()
                    .map(move |(i, b)| (s.address + i as u64, *b))
            })
            .collect()
    }
}

/// Prefix `program` with one byte store into `mem` per `(address, byte)` pair, in the order given.
pub fn materialize_read_only_data(
    mem: &Variable,
    data: impl IntoIterator<Item = (u64, u8)>,
    program: Program,
) -> Program {
    let mut stmts: Vec<Stmt> = data
        .into_iter()
        .map(|(address, byte)| {
            let index = address & RegType::Bit32.mask();
            if index != address {
                debug!(
                    "Read-only address does not fit in 32 bits; truncating";
                    "address" => format!("{:#x}", address),
                    "index" => format!("{:#x}", index),
                );
            }
            Stmt::Assign(
                mem.clone(),
                Expr::Store {
                    array: Box::new(Expr::var(mem)),
                    index: Box::new(Expr::Int(index, RegType::Bit32)),
                    value: Box::new(Expr::Int(byte as u64, RegType::Bit8)),
                    endian: Endian::Little,
                    typ: RegType::Bit8,
                },
                vec![Attribute::InitReadOnly],
            )
        })
        .collect();
    debug!("Materialized read-only data"; "stores" => stmts.len());
    stmts.extend(program.stmts);
    Program::new(stmts)
}

/// A named, half-open address range `[start, end)`
#[derive(Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct FunctionRange {
    pub name: String,
    pub start: u64,
    pub end: u64,
}

/// Function ranges from a symbol table. Each range ends where the next function starts; the last
/// keeps the end of its section. Ranges starting at 0 and the runtime-init symbol are dropped.
pub fn compute_function_ranges(symbols: &[Symbol]) -> Vec<FunctionRange> {
    let sorted: Vec<FunctionRange> = symbols
        .iter()
        .filter(|s| s.is_function)
        .map(|s| FunctionRange {
            name: s.name.clone(),
            start: s.value.wrapping_add(s.section_base),
            end: s.section_base.wrapping_add(s.section_size),
        })
        .sorted_by_key(|r| r.start)
        .collect();

    let next_starts = sorted.iter().skip(1).map(|r| Some(r.start)).chain([None]);
    sorted
        .iter()
        .zip(next_starts)
        .map(|(r, next)| FunctionRange {
            end: next.unwrap_or(r.end),
            ..r.clone()
        })
        .filter(|r| {
            let keep = r.start != 0 && r.name != RUNTIME_INIT_SYMBOL;
            if !keep {
                debug!("Dropping function range"; "name" => &r.name, "start" => r.start);
            }
            keep
        })
        .collect()
}

/// Function ranges of `image`
pub fn function_ranges(image: &impl BinaryImage) -> Result<Vec<FunctionRange>> {
    let symbols = image
        .symbols()
        .map_err(LowerError::SymbolEnumerationFailure)?;
    Ok(compute_function_ranges(&symbols))
}

/// `program` prefixed with the read-only data of `image`
pub fn read_only_data(image: &impl BinaryImage, mem: &Variable, program: Program) -> Result<Program> {
    let snapshot = SectionSnapshot::take(image)?;
    Ok(materialize_read_only_data(
        mem,
        snapshot.read_only_bytes(),
        program,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Type;

    fn func(name: &str, value: u64, section_size: u64) -> Symbol {
        Symbol {
            name: name.into(),
            value,
            is_function: true,
            section_base: 0,
            section_size,
        }
    }

    #[test]
    fn ranges_end_at_next_start() {
        let symbols = vec![
            func("g", 0x140, 0x1000),
            func("h", 0x200, 0x260),
            func("f", 0x100, 0x120),
        ];
        assert_eq!(
            compute_function_ranges(&symbols),
            vec![
                FunctionRange {
                    name: "f".into(),
                    start: 0x100,
                    end: 0x140
                },
                FunctionRange {
                    name: "g".into(),
                    start: 0x140,
                    end: 0x200
                },
                FunctionRange {
                    name: "h".into(),
                    start: 0x200,
                    end: 0x260
                },
            ]
        );
    }

    #[test]
    fn ranges_drop_zero_init_and_non_functions() {
        let mut data = func("table", 0x180, 0x1000);
        data.is_function = false;
        let symbols = vec![
            func("zero", 0, 0x1000),
            func(RUNTIME_INIT_SYMBOL, 0x80, 0x1000),
            func("main", 0x100, 0x1000),
            data,
            func("helper", 0x200, 0x1000),
        ];
        let ranges = compute_function_ranges(&symbols);
        assert_eq!(
            ranges.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            vec!["main", "helper"]
        );
        // Dropped entries still bound their predecessors
        assert_eq!(ranges[0].end, 0x200);
    }

    #[test]
    fn symbol_values_are_section_relative() {
        let s = Symbol {
            name: "f".into(),
            value: 0x10,
            is_function: true,
            section_base: 0x8048000,
            section_size: 0x100,
        };
        assert_eq!(
            compute_function_ranges(&[s]),
            vec![FunctionRange {
                name: "f".into(),
                start: 0x8048010,
                end: 0x8048100
            }]
        );
    }

    struct Image;
    impl BinaryImage for Image {
        fn sections(&self) -> std::result::Result<Vec<Section>, String> {
            Ok(vec![
                Section {
                    name: ".text".into(),
                    address: 0x1000,
                    flags: SectionFlags {
                        loaded: true,
                        read_only: true,
                        code: true,
                    },
                    bytes: vec![0x90, 0xc3],
                },
                Section {
                    name: ".rodata".into(),
                    address: 0x2000,
                    flags: SectionFlags {
                        loaded: true,
                        read_only: true,
                        code: false,
                    },
                    bytes: vec![0x41, 0x42],
                },
                Section {
                    name: ".data".into(),
                    address: 0x3000,
                    flags: SectionFlags {
                        loaded: true,
                        read_only: false,
                        code: false,
                    },
                    bytes: vec![0xff],
                },
            ])
        }
        fn symbols(&self) -> std::result::Result<Vec<Symbol>, String> {
            Err("no symbol table".into())
        }
    }

    #[test]
    fn snapshot_lookups() {
        let snap = SectionSnapshot::take(&Image).unwrap();
        assert_eq!(snap.byte_at(0x1001), Some(0xc3));
        assert_eq!(snap.byte_at(0x3000), Some(0xff));
        assert_eq!(snap.byte_at(0x2002), None);
        assert_eq!(snap.read_only_bytes(), vec![(0x2000, 0x41), (0x2001, 0x42)]);

        let shared = snap.clone();
        let t = std::thread::spawn(move || shared.byte_at(0x2000));
        assert_eq!(t.join().unwrap(), Some(0x41));
    }

    #[test]
    fn read_only_stores_come_first() {
        let mem = Variable::new("mem", Type::Memory { addr: RegType::Bit32 });
        let prog = Program::new(vec![Stmt::Comment("body".into(), vec![])]);
        let prog = read_only_data(&Image, &mem, prog).unwrap();
        assert_eq!(prog.len(), 3);
        assert_eq!(
            prog.stmts[1],
            Stmt::Assign(
                mem.clone(),
                Expr::Store {
                    array: Box::new(Expr::var(&mem)),
                    index: Box::new(Expr::Int(0x2001, RegType::Bit32)),
                    value: Box::new(Expr::Int(0x42, RegType::Bit8)),
                    endian: Endian::Little,
                    typ: RegType::Bit8,
                },
                vec![Attribute::InitReadOnly]
            )
        );
        assert_eq!(prog.stmts[2], Stmt::Comment("body".into(), vec![]));
    }

    #[test]
    fn reader_failures_are_reported() {
        assert_eq!(
            function_ranges(&Image),
            Err(LowerError::SymbolEnumerationFailure("no symbol table".into()))
        );
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn stores_use_32_bit_addresses_in_order(
                data in prop::collection::vec((any::<u64>(), any::<u8>()), 0..16)
            ) {
                let mem = Variable::new("mem", Type::Memory { addr: RegType::Bit32 });
                let prog = materialize_read_only_data(&mem, data.clone(), Program::new(vec![]));
                prop_assert_eq!(prog.len(), data.len());
                for (s, (address, byte)) in prog.stmts.iter().zip(data) {
                    match s {
                        Stmt::Assign(v, Expr::Store { index, value, .. }, attrs) => {
                            prop_assert_eq!(v, &mem);
                            prop_assert_eq!(
                                &**index,
                                &Expr::Int(address & 0xffff_ffff, RegType::Bit32)
                            );
                            prop_assert_eq!(&**value, &Expr::Int(byte as u64, RegType::Bit8));
                            prop_assert_eq!(attrs, &vec![Attribute::InitReadOnly]);
                        }
                        s => prop_assert!(false, "unexpected statement {}", s),
                    }
                }
            }
        }
    }
}
