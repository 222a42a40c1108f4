//! Reader and writer for execution trace files.
//!
//! The format is shared with an external trace producer, so every numeric code and field width
//! below is fixed. All multi-byte fields are little-endian and nothing is padded.
//!
//! A file is a [`TraceHeader`] (with its process and module tables) followed by [`EntryHeader`]s,
//! one per executed instruction, up to the end of the file.

use crate::log::*;
use std::io::{self, Read, Write};
use thiserror::Error;

pub const MAGIC_NUMBER: u32 = 0xFFFF_FFFF;
pub const VERSION_NUMBER: u32 = 50;

pub const MAX_NUM_OPERANDS: usize = 30;
/// Memory-location operands that carry addressing registers, and registers per such operand
pub const MAX_NUM_MEMREGS: usize = 5;
pub const MAX_NUM_TAINTBYTE_RECORDS: usize = 3;
pub const MAX_STRING_LEN: usize = 32;
/// Bytes of an operand that can carry per-byte taint records
pub const MAX_OPERAND_LEN: usize = 8;
pub const MAX_INSN_BYTES: usize = 15;

pub const TAINT_BYTE_RECORD_SIZE: usize = 12;
pub const TAINT_RECORD_FIXED_SIZE: usize = 4;
pub const OPERAND_VAL_FIXED_SIZE: usize = 28;
pub const ENTRY_HEADER_FIXED_SIZE: usize = 44;
pub const PROC_RECORD_FIXED_SIZE: usize = 40;
pub const MODULE_RECORD_SIZE: usize = 40;
pub const TRACE_HEADER_FIXED_SIZE: usize = 12;

pub const TAINT_SOURCE_NIC_IN: u32 = 0;
pub const TAINT_SOURCE_KEYBOARD_IN: u32 = 1;
pub const TAINT_SOURCE_FILE_IN: u32 = 2;
pub const TAINT_SOURCE_NETWORK_OUT: u32 = 3;
pub const TAINT_SOURCE_API_TIME_IN: u32 = 4;
pub const TAINT_SOURCE_API_FILE_IN: u32 = 5;
pub const TAINT_SOURCE_API_REGISTRY_IN: u32 = 6;
pub const TAINT_SOURCE_API_HOSTNAME_IN: u32 = 7;
pub const TAINT_SOURCE_API_FILE_INFO_IN: u32 = 8;
pub const TAINT_SOURCE_API_SOCK_INFO_IN: u32 = 9;
pub const TAINT_SOURCE_API_STR_IN: u32 = 10;
pub const TAINT_SOURCE_API_SYS_IN: u32 = 11;
pub const TAINT_SOURCE_HOOKAPI: u32 = 12;
pub const TAINT_SOURCE_LOOP_IV: u32 = 13;
pub const TAINT_SOURCE_MODULE: u32 = 14;

/// First origin id of TCP flows
pub const TAINT_ORIGIN_START_TCP_NIC_IN: u32 = 10000;
/// First origin id of UDP flows
pub const TAINT_ORIGIN_START_UDP_NIC_IN: u32 = 11000;
/// First origin id of module-tainted data
pub const TAINT_ORIGIN_MODULE: u32 = 20000;

pub const TP_NONE: u16 = 0;
pub const TP_SRC: u16 = 1;
pub const TP_CJMP: u16 = 2;
pub const TP_MEMREAD_INDEX: u16 = 3;
pub const TP_MEMWRITE_INDEX: u16 = 4;
pub const TP_REP_COUNTER: u16 = 5;
pub const TP_SYSENTER: u16 = 6;

/// Failures of the trace codec
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("bad magic number {0:#x}")]
    BadMagic(u32),
    #[error("unsupported trace version {0}")]
    UnsupportedVersion(u32),
    #[error("trace ends in the middle of a record")]
    Truncated,
    #[error("{0} operands (at most {})", MAX_NUM_OPERANDS)]
    TooManyOperands(usize),
    #[error("{0} taint byte records (at most {})", MAX_NUM_TAINTBYTE_RECORDS)]
    TooManyTaintBytes(usize),
    #[error("instruction of {0} bytes (at most {})", MAX_INSN_BYTES)]
    InstructionTooLong(usize),
    #[error("invalid {what} value {value}")]
    InvalidEnum { what: &'static str, value: u32 },
    #[error("name `{0}` does not fit in {} bytes", MAX_STRING_LEN)]
    NameTooLong(String),
    #[error("operand byte {0} has a taint record but is not a tainted byte of the operand")]
    InconsistentTaint(usize),
    #[error(
        "operand {0} has addressing registers but is not a memory location among the first {}",
        MAX_NUM_MEMREGS
    )]
    UnencodableMemregs(usize),
}

pub type Result<T> = std::result::Result<T, TraceError>;

/// Enumerations with fixed numeric codes on the wire
macro_rules! wire_enum {
    ($(#[$m:meta])* $name:ident : $repr:ty { $($(#[$vm:meta])* $var:ident = $val:expr),* $(,)? }) => {
        $(#[$m])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
        pub enum $name {
            #[default]
            $($(#[$vm])* $var = $val),*
        }

        impl $name {
            pub fn code(self) -> $repr {
                self as $repr
            }

            pub fn from_code(v: $repr) -> Result<Self> {
                match v {
                    $(x if x == $val => Ok($name::$var),)*
                    _ => Err(TraceError::InvalidEnum {
                        what: stringify!($name),
                        value: v as u32,
                    }),
                }
            }
        }
    };
}

wire_enum! {
    /// What an operand is
    OperandKind: u32 {
        None = 0,
        Register = 1,
        MemLoc = 2,
        Immediate = 3,
        Jump = 4,
        FloatRegister = 5,
        MemAddress = 6,
        MmxRegister = 7,
        XmmRegister = 8,
        FloatControlRegister = 9,
        Displacement = 10,
    }
}

wire_enum! {
    /// The role an operand plays in the instruction
    OperandUsage: u32 {
        Unknown = 0,
        StackPointer = 1,
        Counter = 2,
        MemoryBase = 3,
        MemoryIndex = 4,
        MemorySegment = 5,
        SegmentEntry0 = 6,
        SegmentEntry1 = 7,
    }
}

wire_enum! {
    /// How an operand is accessed. The `Conditional*` modes only apply if a condition holds.
    OperandAccess: u8 {
        Unknown = 0,
        ReadWrite = 1,
        Read = 2,
        Write = 3,
        ConditionalReadWrite = 4,
        ConditionalWrite = 5,
        ConditionalReadWrite2 = 6,
        ConditionalRead = 7,
    }
}

wire_enum! {
    /// Why taint reached a value
    TaintPropagation: u16 {
        None = 0,
        FromSource = 1,
        ConditionalJumpOnTaintedFlag = 2,
        TaintedMemReadIndex = 3,
        TaintedMemWriteIndex = 4,
        TaintedRepCounter = 5,
        Sysenter = 6,
    }
}

wire_enum! {
    /// The external input channel tainted data came from
    TaintSource: u32 {
        NicIn = 0,
        KeyboardIn = 1,
        FileIn = 2,
        NetworkOut = 3,
        ApiTimeIn = 4,
        ApiFileIn = 5,
        ApiRegistryIn = 6,
        ApiHostnameIn = 7,
        ApiFileInfoIn = 8,
        ApiSockInfoIn = 9,
        ApiStrIn = 10,
        ApiSysIn = 11,
        HookApi = 12,
        LoopIv = 13,
        Module = 14,
    }
}

/// Where one tainted byte came from
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct TaintByteRecord {
    /// A [`TaintSource`] code. Kept raw, producers may use codes this crate does not know.
    pub source: u32,
    /// Flow identifier, see the `TAINT_ORIGIN_*` bands
    pub origin: u32,
    /// Offset within the tainted buffer
    pub offset: u32,
}

impl TaintByteRecord {
    pub fn source(&self) -> Result<TaintSource> {
        TaintSource::from_code(self.source)
    }
}

/// Taint of one byte of an operand
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct TaintRecord {
    pub propagation: TaintPropagation,
    /// At most [`MAX_NUM_TAINTBYTE_RECORDS`]
    pub records: Vec<TaintByteRecord>,
}

/// One operand of a traced instruction
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct OperandVal {
    pub kind: OperandKind,
    pub usage: OperandUsage,
    /// Length in bytes
    pub length: u32,
    /// Register number or memory address
    pub addr: u32,
    pub value: u32,
    /// Bit `i` set means byte `i` is tainted and `records[i]` describes it
    pub tainted: u64,
    pub records: [TaintRecord; MAX_OPERAND_LEN],
    pub access: OperandAccess,
}

impl OperandVal {
    /// Indices of the bytes whose taint records are on the wire
    fn tainted_bytes(&self) -> impl Iterator<Item = usize> + '_ {
        (0..std::cmp::min(self.length as usize, MAX_OPERAND_LEN))
            .filter(move |i| self.tainted & (1 << i) != 0)
    }
}

/// One executed instruction
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct EntryHeader {
    pub address: u32,
    pub tid: u32,
    pub tp: TaintPropagation,
    pub eflags: u32,
    pub cc_op: u32,
    pub df: u32,
    pub hflags: u32,
    pub ldt_base: u32,
    pub gdt_base: u32,
    pub tr_base: u32,
    pub idt_base: u32,
    /// Raw instruction bytes, at most [`MAX_INSN_BYTES`]
    pub raw: Vec<u8>,
    /// At most [`MAX_NUM_OPERANDS`]
    pub operands: Vec<OperandVal>,
    /// `memregs[i]` holds the segment, base, index and two segment-entry registers used by
    /// `operands[i]`. Only present on the wire for the first [`MAX_NUM_MEMREGS`] operands, and
    /// only for memory locations.
    pub memregs: [[OperandVal; MAX_NUM_MEMREGS]; MAX_NUM_MEMREGS],
}

impl EntryHeader {
    /// Operand indices whose addressing registers are on the wire
    fn memreg_operands(&self) -> impl Iterator<Item = usize> + '_ {
        self.operands
            .iter()
            .take(MAX_NUM_MEMREGS)
            .enumerate()
            .filter(|(_, o)| o.kind == OperandKind::MemLoc)
            .map(|(i, _)| i)
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct ModuleRecord {
    pub name: String,
    pub base: u32,
    pub size: u32,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct ProcRecord {
    pub name: String,
    pub pid: u32,
    pub ldt_base: u32,
    pub modules: Vec<ModuleRecord>,
}

/// Everything before the first entry
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct TraceHeader {
    pub gdt_base: u32,
    pub idt_base: u32,
    pub procs: Vec<ProcRecord>,
}

fn wr_u8<W: Write>(w: &mut W, v: u8) -> Result<()> {
    Ok(w.write_all(&[v])?)
}
fn wr_u16le<W: Write>(w: &mut W, v: u16) -> Result<()> {
    Ok(w.write_all(&v.to_le_bytes())?)
}
fn wr_u32le<W: Write>(w: &mut W, v: u32) -> Result<()> {
    Ok(w.write_all(&v.to_le_bytes())?)
}
fn wr_u64le<W: Write>(w: &mut W, v: u64) -> Result<()> {
    Ok(w.write_all(&v.to_le_bytes())?)
}
fn wr_name<W: Write>(w: &mut W, name: &str) -> Result<()> {
    // Room for the terminating NUL
    if name.len() >= MAX_STRING_LEN {
        return Err(TraceError::NameTooLong(name.to_owned()));
    }
    let mut b = [0u8; MAX_STRING_LEN];
    b[..name.len()].copy_from_slice(name.as_bytes());
    Ok(w.write_all(&b)?)
}

fn rd_exact<R: Read>(r: &mut R, b: &mut [u8]) -> Result<()> {
    r.read_exact(b).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => TraceError::Truncated,
        _ => TraceError::Io(e),
    })
}
fn rd_u8<R: Read>(r: &mut R) -> Result<u8> {
    let mut b = [0u8; 1];
    rd_exact(r, &mut b)?;
    Ok(b[0])
}
fn rd_u16le<R: Read>(r: &mut R) -> Result<u16> {
    let mut b = [0u8; 2];
    rd_exact(r, &mut b)?;
    Ok(u16::from_le_bytes(b))
}
fn rd_u32le<R: Read>(r: &mut R) -> Result<u32> {
    let mut b = [0u8; 4];
    rd_exact(r, &mut b)?;
    Ok(u32::from_le_bytes(b))
}
fn rd_u64le<R: Read>(r: &mut R) -> Result<u64> {
    let mut b = [0u8; 8];
    rd_exact(r, &mut b)?;
    Ok(u64::from_le_bytes(b))
}
fn rd_name<R: Read>(r: &mut R) -> Result<String> {
    let mut b = [0u8; MAX_STRING_LEN];
    rd_exact(r, &mut b)?;
    let end = b.iter().position(|&c| c == 0).unwrap_or(MAX_STRING_LEN);
    Ok(String::from_utf8_lossy(&b[..end]).into_owned())
}

/// Fill `b`, or return `false` if the reader is already at its end.
fn rd_exact_or_eof<R: Read>(r: &mut R, b: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < b.len() {
        match r.read(&mut b[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(TraceError::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

fn encode_taint_record<W: Write>(w: &mut W, t: &TaintRecord) -> Result<()> {
    if t.records.len() > MAX_NUM_TAINTBYTE_RECORDS {
        return Err(TraceError::TooManyTaintBytes(t.records.len()));
    }
    wr_u16le(w, t.propagation.code())?;
    wr_u16le(w, t.records.len() as u16)?;
    for b in &t.records {
        wr_u32le(w, b.source)?;
        wr_u32le(w, b.origin)?;
        wr_u32le(w, b.offset)?;
    }
    Ok(())
}

fn decode_taint_record<R: Read>(r: &mut R) -> Result<TaintRecord> {
    let propagation = TaintPropagation::from_code(rd_u16le(r)?)?;
    let n = rd_u16le(r)? as usize;
    if n > MAX_NUM_TAINTBYTE_RECORDS {
        return Err(TraceError::TooManyTaintBytes(n));
    }
    let records = (0..n)
        .map(|_| {
            Ok(TaintByteRecord {
                source: rd_u32le(r)?,
                origin: rd_u32le(r)?,
                offset: rd_u32le(r)?,
            })
        })
        .collect::<Result<_>>()?;
    Ok(TaintRecord {
        propagation,
        records,
    })
}

/// Write one operand: the fixed part, then a taint record per tainted byte, then the access mode.
///
/// Taint records of bytes that are not on the wire must be empty.
pub fn encode_operand<W: Write>(w: &mut W, o: &OperandVal) -> Result<()> {
    let on_wire: Vec<usize> = o.tainted_bytes().collect();
    if let Some(i) = (0..MAX_OPERAND_LEN)
        .find(|i| !on_wire.contains(i) && o.records[*i] != TaintRecord::default())
    {
        return Err(TraceError::InconsistentTaint(i));
    }
    wr_u32le(w, o.kind.code())?;
    wr_u32le(w, o.usage.code())?;
    wr_u32le(w, o.length)?;
    wr_u32le(w, o.addr)?;
    wr_u32le(w, o.value)?;
    wr_u64le(w, o.tainted)?;
    for i in on_wire {
        encode_taint_record(w, &o.records[i])?;
    }
    wr_u8(w, o.access.code())
}

pub fn decode_operand<R: Read>(r: &mut R) -> Result<OperandVal> {
    let mut o = OperandVal {
        kind: OperandKind::from_code(rd_u32le(r)?)?,
        usage: OperandUsage::from_code(rd_u32le(r)?)?,
        length: rd_u32le(r)?,
        addr: rd_u32le(r)?,
        value: rd_u32le(r)?,
        tainted: rd_u64le(r)?,
        ..Default::default()
    };
    let tainted: Vec<usize> = o.tainted_bytes().collect();
    for i in tainted {
        o.records[i] = decode_taint_record(r)?;
    }
    o.access = OperandAccess::from_code(rd_u8(r)?)?;
    Ok(o)
}

/// Write one instruction entry.
///
/// Addressing registers of operands that are not on the wire must be empty.
pub fn encode_entry<W: Write>(w: &mut W, e: &EntryHeader) -> Result<()> {
    if e.raw.len() > MAX_INSN_BYTES {
        return Err(TraceError::InstructionTooLong(e.raw.len()));
    }
    if e.operands.len() > MAX_NUM_OPERANDS {
        return Err(TraceError::TooManyOperands(e.operands.len()));
    }
    let memreg_operands: Vec<usize> = e.memreg_operands().collect();
    if let Some(i) = (0..MAX_NUM_MEMREGS).find(|i| {
        !memreg_operands.contains(i) && e.memregs[*i].iter().any(|o| *o != OperandVal::default())
    }) {
        return Err(TraceError::UnencodableMemregs(i));
    }
    wr_u32le(w, e.address)?;
    wr_u32le(w, e.tid)?;
    wr_u16le(w, e.raw.len() as u16)?;
    wr_u8(w, e.operands.len() as u8)?;
    wr_u8(w, e.tp.code() as u8)?;
    for v in [
        e.eflags, e.cc_op, e.df, e.hflags, e.ldt_base, e.gdt_base, e.tr_base, e.idt_base,
    ] {
        wr_u32le(w, v)?;
    }
    w.write_all(&e.raw)?;
    for o in &e.operands {
        encode_operand(w, o)?;
    }
    for i in memreg_operands {
        for o in &e.memregs[i] {
            encode_operand(w, o)?;
        }
    }
    Ok(())
}

fn decode_entry_after_address<R: Read>(r: &mut R, address: u32) -> Result<EntryHeader> {
    let tid = rd_u32le(r)?;
    let inst_size = rd_u16le(r)? as usize;
    let num_operands = rd_u8(r)? as usize;
    let tp = rd_u8(r)?;
    if inst_size > MAX_INSN_BYTES {
        return Err(TraceError::InstructionTooLong(inst_size));
    }
    if num_operands > MAX_NUM_OPERANDS {
        return Err(TraceError::TooManyOperands(num_operands));
    }
    let mut e = EntryHeader {
        address,
        tid,
        tp: TaintPropagation::from_code(tp as u16)?,
        eflags: rd_u32le(r)?,
        cc_op: rd_u32le(r)?,
        df: rd_u32le(r)?,
        hflags: rd_u32le(r)?,
        ldt_base: rd_u32le(r)?,
        gdt_base: rd_u32le(r)?,
        tr_base: rd_u32le(r)?,
        idt_base: rd_u32le(r)?,
        raw: vec![0; inst_size],
        ..Default::default()
    };
    rd_exact(r, &mut e.raw)?;
    e.operands = (0..num_operands)
        .map(|_| decode_operand(r))
        .collect::<Result<_>>()?;
    let memreg_operands: Vec<usize> = e.memreg_operands().collect();
    for i in memreg_operands {
        for slot in 0..MAX_NUM_MEMREGS {
            e.memregs[i][slot] = decode_operand(r)?;
        }
    }
    Ok(e)
}

/// Read one instruction entry.
pub fn decode_entry<R: Read>(r: &mut R) -> Result<EntryHeader> {
    let address = rd_u32le(r)?;
    decode_entry_after_address(r, address)
}

fn encode_header<W: Write>(w: &mut W, h: &TraceHeader) -> Result<()> {
    wr_u32le(w, MAGIC_NUMBER)?;
    wr_u32le(w, VERSION_NUMBER)?;
    wr_u32le(w, h.procs.len() as u32)?;
    wr_u32le(w, h.gdt_base)?;
    wr_u32le(w, h.idt_base)?;
    for p in &h.procs {
        wr_name(w, &p.name)?;
        wr_u32le(w, p.pid)?;
        wr_u32le(w, p.modules.len() as u32)?;
        wr_u32le(w, p.ldt_base)?;
        for m in &p.modules {
            wr_name(w, &m.name)?;
            wr_u32le(w, m.base)?;
            wr_u32le(w, m.size)?;
        }
    }
    Ok(())
}

fn decode_header<R: Read>(r: &mut R) -> Result<TraceHeader> {
    let magic = rd_u32le(r)?;
    if magic != MAGIC_NUMBER {
        return Err(TraceError::BadMagic(magic));
    }
    let version = rd_u32le(r)?;
    if version != VERSION_NUMBER {
        return Err(TraceError::UnsupportedVersion(version));
    }
    let n_procs = rd_u32le(r)?;
    let gdt_base = rd_u32le(r)?;
    let idt_base = rd_u32le(r)?;
    let procs = (0..n_procs)
        .map(|_| {
            let name = rd_name(r)?;
            let pid = rd_u32le(r)?;
            let n_mods = rd_u32le(r)?;
            let ldt_base = rd_u32le(r)?;
            let modules = (0..n_mods)
                .map(|_| {
                    Ok(ModuleRecord {
                        name: rd_name(r)?,
                        base: rd_u32le(r)?,
                        size: rd_u32le(r)?,
                    })
                })
                .collect::<Result<_>>()?;
            Ok(ProcRecord {
                name,
                pid,
                ldt_base,
                modules,
            })
        })
        .collect::<Result<_>>()?;
    Ok(TraceHeader {
        gdt_base,
        idt_base,
        procs,
    })
}

/// Writes a trace: the header once at creation, then any number of entries.
pub struct TraceWriter<W: Write> {
    writer: W,
    entries: usize,
}

impl<W: Write> TraceWriter<W> {
    pub fn new(mut writer: W, header: &TraceHeader) -> Result<Self> {
        encode_header(&mut writer, header)?;
        debug!("Wrote trace header"; "procs" => header.procs.len());
        Ok(Self { writer, entries: 0 })
    }

    pub fn write_entry(&mut self, e: &EntryHeader) -> Result<()> {
        encode_entry(&mut self.writer, e)?;
        self.entries += 1;
        Ok(())
    }

    /// Flush and hand back the underlying writer
    pub fn finish(mut self) -> Result<W> {
        self.writer.flush()?;
        debug!("Finished trace"; "entries" => self.entries);
        Ok(self.writer)
    }
}

/// Reads a trace. The header is validated at creation; entries are then yielded in file order
/// until the file ends cleanly. Iteration stops after the first error.
pub struct TraceReader<R: Read> {
    reader: R,
    header: TraceHeader,
    done: bool,
}

impl<R: Read> TraceReader<R> {
    pub fn new(mut reader: R) -> Result<Self> {
        let header = decode_header(&mut reader)?;
        debug!(
            "Read trace header";
            "procs" => header.procs.len(),
            "gdt_base" => format!("{:#x}", header.gdt_base),
        );
        Ok(Self {
            reader,
            header,
            done: false,
        })
    }

    pub fn header(&self) -> &TraceHeader {
        &self.header
    }

    fn next_entry(&mut self) -> Result<Option<EntryHeader>> {
        let mut b = [0u8; 4];
        if !rd_exact_or_eof(&mut self.reader, &mut b)? {
            return Ok(None);
        }
        decode_entry_after_address(&mut self.reader, u32::from_le_bytes(b)).map(Some)
    }
}

impl<R: Read> Iterator for TraceReader<R> {
    type Item = Result<EntryHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let r = self.next_entry().transpose();
        if !matches!(r, Some(Ok(_))) {
            self.done = true;
        }
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(addr: u32, value: u32) -> OperandVal {
        OperandVal {
            kind: OperandKind::Register,
            usage: OperandUsage::Unknown,
            length: 4,
            addr,
            value,
            access: OperandAccess::Read,
            ..Default::default()
        }
    }

    fn entry() -> EntryHeader {
        let mut tainted = reg(0x1000, 0x41424344);
        tainted.kind = OperandKind::MemLoc;
        tainted.tainted = 0b0101;
        tainted.records[0] = TaintRecord {
            propagation: TaintPropagation::FromSource,
            records: vec![TaintByteRecord {
                source: TAINT_SOURCE_NIC_IN,
                origin: TAINT_ORIGIN_START_TCP_NIC_IN + 3,
                offset: 17,
            }],
        };
        tainted.records[2] = TaintRecord {
            propagation: TaintPropagation::TaintedMemReadIndex,
            records: vec![TaintByteRecord::default(); MAX_NUM_TAINTBYTE_RECORDS],
        };
        let mut e = EntryHeader {
            address: 0x8048000,
            tid: 7,
            tp: TaintPropagation::ConditionalJumpOnTaintedFlag,
            eflags: 0x246,
            cc_op: 3,
            df: 1,
            hflags: 0x40,
            ldt_base: 0x10,
            gdt_base: 0x20,
            tr_base: 0x30,
            idt_base: 0x40,
            raw: vec![0x8b, 0x45, 0x08],
            operands: vec![reg(0, 1), tainted],
            ..Default::default()
        };
        e.memregs[1][1] = reg(5, 0x1000);
        e.memregs[1][1].usage = OperandUsage::MemoryBase;
        e
    }

    fn header() -> TraceHeader {
        TraceHeader {
            gdt_base: 0x8000,
            idt_base: 0x9000,
            procs: vec![ProcRecord {
                name: "server.exe".into(),
                pid: 1234,
                ldt_base: 0,
                modules: vec![
                    ModuleRecord {
                        name: "server.exe".into(),
                        base: 0x400000,
                        size: 0x2000,
                    },
                    ModuleRecord {
                        name: "ntdll.dll".into(),
                        base: 0x7c900000,
                        size: 0xb0000,
                    },
                ],
            }],
        }
    }

    #[test]
    fn fixed_sizes() {
        let mut buf: Vec<u8> = vec![];
        encode_entry(&mut buf, &EntryHeader::default()).unwrap();
        assert_eq!(buf.len(), ENTRY_HEADER_FIXED_SIZE);

        let mut buf: Vec<u8> = vec![];
        encode_operand(&mut buf, &OperandVal::default()).unwrap();
        assert_eq!(buf.len(), OPERAND_VAL_FIXED_SIZE + 1);

        let mut buf: Vec<u8> = vec![];
        encode_taint_record(&mut buf, &TaintRecord::default()).unwrap();
        assert_eq!(buf.len(), TAINT_RECORD_FIXED_SIZE);

        let mut buf: Vec<u8> = vec![];
        encode_header(&mut buf, &TraceHeader::default()).unwrap();
        assert_eq!(buf.len(), TRACE_HEADER_FIXED_SIZE + 8);

        let mut buf: Vec<u8> = vec![];
        let mut h = header();
        h.procs[0].modules.truncate(1);
        encode_header(&mut buf, &h).unwrap();
        assert_eq!(
            buf.len(),
            TRACE_HEADER_FIXED_SIZE + 8 + PROC_RECORD_FIXED_SIZE + 4 + MODULE_RECORD_SIZE
        );
    }

    #[test]
    fn entry_layout() {
        let e = entry();
        let mut buf: Vec<u8> = vec![];
        encode_entry(&mut buf, &e).unwrap();
        let taint = TAINT_RECORD_FIXED_SIZE * 2 + TAINT_BYTE_RECORD_SIZE * 4;
        let operand = OPERAND_VAL_FIXED_SIZE + 1;
        assert_eq!(
            buf.len(),
            ENTRY_HEADER_FIXED_SIZE + 3 + 2 * operand + taint + MAX_NUM_MEMREGS * operand
        );
        assert_eq!(&buf[0..4], &0x8048000u32.to_le_bytes());
        assert_eq!(&buf[8..10], &3u16.to_le_bytes());
        assert_eq!(buf[10], 2);
        assert_eq!(buf[11], TP_CJMP as u8);
    }

    #[test]
    fn entry_round_trip() {
        let e = entry();
        let mut buf: Vec<u8> = vec![];
        encode_entry(&mut buf, &e).unwrap();
        let d = decode_entry(&mut buf.as_slice()).unwrap();
        assert_eq!(d, e);
    }

    #[test]
    fn trace_round_trip() {
        let mut w = TraceWriter::new(Vec::<u8>::new(), &header()).unwrap();
        w.write_entry(&entry()).unwrap();
        w.write_entry(&EntryHeader::default()).unwrap();
        let buf = w.finish().unwrap();

        let r = TraceReader::new(buf.as_slice()).unwrap();
        assert_eq!(r.header(), &header());
        let entries = r.collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(entries, vec![entry(), EntryHeader::default()]);
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut buf: Vec<u8> = vec![];
        encode_header(&mut buf, &header()).unwrap();

        let mut bad = buf.clone();
        bad[0] = 0;
        assert!(matches!(
            TraceReader::new(bad.as_slice()),
            Err(TraceError::BadMagic(0xFFFF_FF00))
        ));

        let mut bad = buf;
        bad[4..8].copy_from_slice(&49u32.to_le_bytes());
        assert!(matches!(
            TraceReader::new(bad.as_slice()),
            Err(TraceError::UnsupportedVersion(49))
        ));
    }

    #[test]
    fn truncated_entry_stops_iteration() {
        let mut w = TraceWriter::new(Vec::<u8>::new(), &TraceHeader::default()).unwrap();
        w.write_entry(&entry()).unwrap();
        let mut buf = w.finish().unwrap();
        buf.truncate(buf.len() - 1);

        let mut r = TraceReader::new(buf.as_slice()).unwrap();
        assert!(matches!(r.next(), Some(Err(TraceError::Truncated))));
        assert!(r.next().is_none());
    }

    #[test]
    fn bounds_are_enforced() {
        let mut e = EntryHeader::default();
        e.operands = vec![OperandVal::default(); MAX_NUM_OPERANDS + 1];
        assert!(matches!(
            encode_entry(&mut io::sink(), &e),
            Err(TraceError::TooManyOperands(31))
        ));

        let mut e = EntryHeader::default();
        e.raw = vec![0x90; MAX_INSN_BYTES + 1];
        assert!(matches!(
            encode_entry(&mut io::sink(), &e),
            Err(TraceError::InstructionTooLong(16))
        ));

        let t = TaintRecord {
            propagation: TaintPropagation::FromSource,
            records: vec![TaintByteRecord::default(); 4],
        };
        assert!(matches!(
            encode_taint_record(&mut io::sink(), &t),
            Err(TraceError::TooManyTaintBytes(4))
        ));

        let mut h = header();
        h.procs[0].name = "x".repeat(MAX_STRING_LEN);
        assert!(matches!(
            TraceWriter::new(Vec::<u8>::new(), &h),
            Err(TraceError::NameTooLong(_))
        ));
    }

    #[test]
    fn unknown_codes_are_rejected() {
        let mut buf: Vec<u8> = vec![];
        encode_operand(&mut buf, &reg(0, 0)).unwrap();
        buf[0] = 11;
        assert!(matches!(
            decode_operand(&mut buf.as_slice()),
            Err(TraceError::InvalidEnum {
                what: "OperandKind",
                value: 11
            })
        ));
    }

    #[test]
    fn taint_codes_match_constants() {
        assert_eq!(TaintPropagation::Sysenter.code(), TP_SYSENTER);
        assert_eq!(
            TaintPropagation::from_code(TP_REP_COUNTER).unwrap(),
            TaintPropagation::TaintedRepCounter
        );
        assert_eq!(TaintSource::Module.code(), TAINT_SOURCE_MODULE);
        assert_eq!(
            TaintSource::from_code(TAINT_SOURCE_API_SYS_IN).unwrap(),
            TaintSource::ApiSysIn
        );
        let b = TaintByteRecord {
            source: TAINT_SOURCE_KEYBOARD_IN,
            origin: 0,
            offset: 0,
        };
        assert_eq!(b.source().unwrap(), TaintSource::KeyboardIn);
    }

    #[test]
    fn data_the_wire_cannot_carry_is_rejected() {
        // Tainted bit beyond the operand's length
        let mut o = reg(0, 0);
        o.length = 2;
        o.tainted = 0b100;
        o.records[2] = TaintRecord {
            propagation: TaintPropagation::FromSource,
            records: vec![TaintByteRecord {
                source: 1,
                origin: 2,
                offset: 3,
            }],
        };
        assert!(matches!(
            encode_operand(&mut io::sink(), &o),
            Err(TraceError::InconsistentTaint(2))
        ));
        let mut e = EntryHeader::default();
        e.operands = vec![o];
        assert!(matches!(
            encode_entry(&mut io::sink(), &e),
            Err(TraceError::InconsistentTaint(2))
        ));

        // Record for an untainted byte
        let mut o = reg(0, 0);
        o.records[1].propagation = TaintPropagation::FromSource;
        assert!(matches!(
            encode_operand(&mut io::sink(), &o),
            Err(TraceError::InconsistentTaint(1))
        ));

        // A set bit beyond the length with no record is kept as is
        let mut o = reg(0, 0);
        o.tainted = 1 << 40;
        let mut buf: Vec<u8> = vec![];
        encode_operand(&mut buf, &o).unwrap();
        assert_eq!(decode_operand(&mut buf.as_slice()).unwrap(), o);

        // Addressing registers of a register operand
        let mut e = EntryHeader::default();
        e.operands = vec![reg(0, 0)];
        e.memregs[0][2] = reg(5, 0);
        assert!(matches!(
            encode_entry(&mut io::sink(), &e),
            Err(TraceError::UnencodableMemregs(0))
        ));

        // Addressing registers of an operand that does not exist
        let mut e = entry();
        e.memregs[3][0] = reg(5, 0);
        assert!(matches!(
            encode_entry(&mut io::sink(), &e),
            Err(TraceError::UnencodableMemregs(3))
        ));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn taint_record_strategy() -> impl Strategy<Value = TaintRecord> {
            (
                TP_NONE..=TP_SYSENTER,
                prop::collection::vec(
                    (any::<u32>(), any::<u32>(), any::<u32>()).prop_map(
                        |(source, origin, offset)| TaintByteRecord {
                            source,
                            origin,
                            offset,
                        },
                    ),
                    0..=MAX_NUM_TAINTBYTE_RECORDS,
                ),
            )
                .prop_map(|(tp, records)| TaintRecord {
                    propagation: TaintPropagation::from_code(tp).unwrap(),
                    records,
                })
        }

        /// Operands whose taint records are all representable on the wire
        fn operand_strategy() -> impl Strategy<Value = OperandVal> {
            (
                0u32..=10,
                0u32..=7,
                0u32..=12,
                any::<u32>(),
                any::<u32>(),
                any::<u64>(),
                prop::array::uniform8(taint_record_strategy()),
                0u8..=7,
            )
                .prop_map(
                    |(kind, usage, length, addr, value, tainted, mut records, access)| {
                        let mut o = OperandVal {
                            kind: OperandKind::from_code(kind).unwrap(),
                            usage: OperandUsage::from_code(usage).unwrap(),
                            length,
                            addr,
                            value,
                            tainted,
                            access: OperandAccess::from_code(access).unwrap(),
                            ..Default::default()
                        };
                        let on_wire: Vec<usize> = o.tainted_bytes().collect();
                        for i in on_wire {
                            o.records[i] = std::mem::take(&mut records[i]);
                        }
                        o
                    },
                )
        }

        fn entry_strategy() -> impl Strategy<Value = EntryHeader> {
            (
                (any::<u32>(), any::<u32>(), TP_NONE..=TP_SYSENTER),
                prop::array::uniform8(any::<u32>()),
                prop::collection::vec(any::<u8>(), 0..=MAX_INSN_BYTES),
                prop::collection::vec(operand_strategy(), 0..=MAX_NUM_OPERANDS),
                prop::array::uniform5(prop::array::uniform5(operand_strategy())),
            )
                .prop_map(|((address, tid, tp), regs, raw, operands, mut memregs)| {
                    let mut e = EntryHeader {
                        address,
                        tid,
                        tp: TaintPropagation::from_code(tp).unwrap(),
                        eflags: regs[0],
                        cc_op: regs[1],
                        df: regs[2],
                        hflags: regs[3],
                        ldt_base: regs[4],
                        gdt_base: regs[5],
                        tr_base: regs[6],
                        idt_base: regs[7],
                        raw,
                        operands,
                        ..Default::default()
                    };
                    let memreg_operands: Vec<usize> = e.memreg_operands().collect();
                    for i in memreg_operands {
                        e.memregs[i] = std::mem::take(&mut memregs[i]);
                    }
                    e
                })
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 128,
                ..ProptestConfig::default()
            })]

            #[test]
            fn entries_round_trip(e in entry_strategy()) {
                let mut buf: Vec<u8> = vec![];
                encode_entry(&mut buf, &e).unwrap();
                let mut rest = buf.as_slice();
                prop_assert_eq!(decode_entry(&mut rest).unwrap(), e);
                prop_assert!(rest.is_empty());
            }

            #[test]
            fn traces_round_trip(entries in prop::collection::vec(entry_strategy(), 0..4)) {
                let mut w = TraceWriter::new(Vec::<u8>::new(), &TraceHeader::default()).unwrap();
                for e in &entries {
                    w.write_entry(e).unwrap();
                }
                let buf = w.finish().unwrap();
                let r = TraceReader::new(buf.as_slice()).unwrap();
                prop_assert_eq!(r.collect::<Result<Vec<_>>>().unwrap(), entries);
            }

            #[test]
            fn off_wire_taint_records_are_rejected(
                o in operand_strategy(),
                i in 0..MAX_OPERAND_LEN,
                t in taint_record_strategy()
            ) {
                prop_assume!(t != TaintRecord::default());
                prop_assume!(!o.tainted_bytes().any(|b| b == i));
                let mut o = o;
                o.records[i] = t;
                prop_assert!(matches!(
                    encode_operand(&mut io::sink(), &o),
                    Err(TraceError::InconsistentTaint(b)) if b == i
                ));
            }
        }
    }
}
