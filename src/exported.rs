//! A reader for lifter exports: a line-oriented text dump of what the external lifter produced for
//! a binary, together with the binary's sections and symbols.
//!
//! ```text
//! PROGRAM
//! arch x86
//!
//! SECTIONS
//! .rodata 0x8049000 loaded,readonly 48656c6c6f00
//!
//! SYMBOLS
//! main 0x10 function 0x8048000 0x200
//!
//! BLOCKS
//! BLOCK 0x8048010 2 mov %eax,%ebx
//! 	MOVE (TEMP R_EBX 32) (TEMP R_EAX 32)
//! ```
//!
//! Statements inside a block are indented. Expressions are parenthesized prefix forms; see
//! [`parse_expr`].

use crate::foreign::{
    ForeignBinOp, ForeignBlock, ForeignCast, ForeignContext, ForeignExpr, ForeignStmt, ForeignUnOp,
    Lifter,
};
use crate::log::*;
use crate::materialize::{BinaryImage, Section, SectionFlags, Symbol};
use crate::registry::Arch;

use itertools::Itertools;
use thiserror::Error;

/// A malformed export
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct ExportParseError {
    pub line: usize,
    pub message: String,
}

type ParseResult<T> = std::result::Result<T, String>;

/// Everything a lifter export holds
#[derive(Clone, Debug)]
pub struct ExportedProgram {
    pub arch: Arch,
    pub sections: Vec<Section>,
    pub symbols: Vec<Symbol>,
    pub blocks: Vec<ForeignBlock>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Part {
    Preamble,
    Program,
    Sections,
    Symbols,
    Blocks,
}

impl std::str::FromStr for ExportedProgram {
    type Err = ExportParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut part = Part::Preamble;
        let mut arch = None;
        let mut sections = vec![];
        let mut symbols = vec![];
        let mut blocks: Vec<ForeignBlock> = vec![];

        for (i, raw) in s.lines().enumerate() {
            let at = |message: String| ExportParseError {
                line: i + 1,
                message,
            };
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let header = match line {
                "PROGRAM" => Some(Part::Program),
                "SECTIONS" => Some(Part::Sections),
                "SYMBOLS" => Some(Part::Symbols),
                "BLOCKS" => Some(Part::Blocks),
                _ => None,
            };
            if let Some(h) = header {
                part = h;
                continue;
            }
            match part {
                Part::Preamble => {
                    return Err(at(format!("expected a section header, got {:?}", line)))
                }
                Part::Program => match line.split_whitespace().collect_tuple::<(_, _)>() {
                    Some(("arch", a)) => arch = Some(a.parse::<Arch>().map_err(at)?),
                    _ => return Err(at(format!("unknown program property {:?}", line))),
                },
                Part::Sections => sections.push(parse_section(line).map_err(at)?),
                Part::Symbols => symbols.push(parse_symbol(line).map_err(at)?),
                Part::Blocks => {
                    if raw.starts_with(char::is_whitespace) {
                        let stmt = parse_stmt(line).map_err(at)?;
                        match blocks.last_mut() {
                            Some(b) => b.stmts.push(stmt),
                            None => return Err(at("statement outside of a block".into())),
                        }
                    } else {
                        blocks.push(parse_block_line(line).map_err(at)?);
                    }
                }
            }
        }

        let arch = arch.ok_or_else(|| ExportParseError {
            line: 0,
            message: "no `arch` in PROGRAM section".into(),
        })?;
        debug!(
            "Parsed lifter export";
            "arch" => ?arch,
            "sections" => sections.len(),
            "symbols" => symbols.len(),
            "blocks" => blocks.len(),
        );
        Ok(Self {
            arch,
            sections,
            symbols,
            blocks,
        })
    }
}

impl Lifter for ExportedProgram {
    fn lift_block(&self, address: u64) -> Result<ForeignBlock, String> {
        self.blocks
            .iter()
            .find(|b| b.address == address)
            .cloned()
            .ok_or_else(|| format!("no block at {:#x}", address))
    }

    fn blocks(&self) -> Result<Vec<ForeignBlock>, String> {
        Ok(self.blocks.clone())
    }

    fn release(&mut self) {
        self.blocks = vec![];
    }
}

impl BinaryImage for ExportedProgram {
    fn sections(&self) -> Result<Vec<Section>, String> {
        Ok(self.sections.clone())
    }

    fn symbols(&self) -> Result<Vec<Symbol>, String> {
        Ok(self.symbols.clone())
    }
}

fn parse_num(s: &str) -> ParseResult<u64> {
    match s.strip_prefix("0x") {
        Some(h) => u64::from_str_radix(h, 16),
        None => s.parse(),
    }
    .map_err(|e| format!("bad number {:?}: {}", s, e))
}

fn parse_hex(s: &str) -> ParseResult<u64> {
    u64::from_str_radix(s.strip_prefix("0x").unwrap_or(s), 16)
        .map_err(|e| format!("bad hex number {:?}: {}", s, e))
}

fn parse_width(s: &str) -> ParseResult<u32> {
    s.parse().map_err(|e| format!("bad width {:?}: {}", s, e))
}

fn parse_flags<'a>(s: &'a str, known: &[&str]) -> ParseResult<Vec<&'a str>> {
    if s == "-" {
        return Ok(vec![]);
    }
    s.split(',')
        .map(|f| {
            if known.contains(&f) {
                Ok(f)
            } else {
                Err(format!("unknown flag {:?}", f))
            }
        })
        .collect()
}

fn parse_section(line: &str) -> ParseResult<Section> {
    let (name, address, flags, bytes) = line
        .split_whitespace()
        .collect_tuple::<(_, _, _, _)>()
        .ok_or_else(|| format!("expected `<name> <address> <flags> <bytes>`, got {:?}", line))?;
    let flags = parse_flags(flags, &["loaded", "readonly", "code"])?;
    let bytes = if bytes == "-" {
        vec![]
    } else {
        if bytes.len() % 2 != 0 {
            return Err(format!("odd number of hex digits in section {}", name));
        }
        bytes
            .chars()
            .tuples::<(char, char)>()
            .map(|(h, l)| {
                u8::from_str_radix(&format!("{}{}", h, l), 16)
                    .map_err(|e| format!("bad byte in section {}: {}", name, e))
            })
            .collect::<ParseResult<_>>()?
    };
    Ok(Section {
        name: name.to_owned(),
        address: parse_hex(address)?,
        flags: SectionFlags {
            loaded: flags.contains(&"loaded"),
            read_only: flags.contains(&"readonly"),
            code: flags.contains(&"code"),
        },
        bytes,
    })
}

fn parse_symbol(line: &str) -> ParseResult<Symbol> {
    let (name, value, flags, base, size) = line
        .split_whitespace()
        .collect_tuple::<(_, _, _, _, _)>()
        .ok_or_else(|| {
            format!(
                "expected `<name> <value> <flags> <section base> <section size>`, got {:?}",
                line
            )
        })?;
    Ok(Symbol {
        name: name.to_owned(),
        value: parse_hex(value)?,
        is_function: parse_flags(flags, &["function"])?.contains(&"function"),
        section_base: parse_hex(base)?,
        section_size: parse_hex(size)?,
    })
}

fn parse_block_line(line: &str) -> ParseResult<ForeignBlock> {
    let mut fields = line.splitn(4, ' ');
    if fields.next() != Some("BLOCK") {
        return Err(format!("expected `BLOCK`, got {:?}", line));
    }
    let address = parse_hex(fields.next().ok_or("missing block address")?)?;
    let length = parse_num(fields.next().ok_or("missing block length")?)?;
    let disassembly = fields
        .next()
        .map(|d| d.trim().to_owned())
        .filter(|d| !d.is_empty());
    Ok(ForeignBlock {
        address,
        length,
        disassembly,
        stmts: vec![],
    })
}

/// A parenthesized prefix form
#[derive(Clone, PartialEq, Eq, Debug)]
enum SExp {
    Atom(String),
    Str(String),
    List(Vec<SExp>),
}

impl SExp {
    fn atom(&self) -> ParseResult<&str> {
        match self {
            SExp::Atom(a) => Ok(a),
            e => Err(format!("expected an atom, got {:?}", e)),
        }
    }
}

fn parse_sexps(s: &str) -> ParseResult<Vec<SExp>> {
    let mut stack: Vec<Vec<SExp>> = vec![vec![]];
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '(' => stack.push(vec![]),
            ')' => {
                let l = stack.pop().ok_or("unbalanced `)`")?;
                stack
                    .last_mut()
                    .ok_or("unbalanced `)`")?
                    .push(SExp::List(l));
            }
            '"' => {
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => text.push(chars.next().ok_or("unterminated string")?),
                        Some(c) => text.push(c),
                        None => return Err("unterminated string".into()),
                    }
                }
                stack.last_mut().ok_or("unbalanced `)`")?.push(SExp::Str(text));
            }
            c => {
                let mut atom = c.to_string();
                while let Some(&n) = chars.peek() {
                    if n.is_whitespace() || n == '(' || n == ')' || n == '"' {
                        break;
                    }
                    atom.push(n);
                    chars.next();
                }
                stack.last_mut().ok_or("unbalanced `)`")?.push(SExp::Atom(atom));
            }
        }
    }
    match stack.pop() {
        Some(top) if stack.is_empty() => Ok(top),
        _ => Err("unbalanced `(`".into()),
    }
}

fn parse_binop(s: &str) -> ParseResult<ForeignBinOp> {
    use ForeignBinOp::*;
    Ok(match s {
        "PLUS" => Plus,
        "MINUS" => Minus,
        "TIMES" => Times,
        "DIVIDE" => Divide,
        "MOD" => Mod,
        "LSHIFT" => LShift,
        "RSHIFT" => RShift,
        "ARSHIFT" => ARShift,
        "LROTATE" => LRotate,
        "RROTATE" => RRotate,
        "LOGICAND" => LogicAnd,
        "LOGICOR" => LogicOr,
        "BITAND" => BitAnd,
        "BITOR" => BitOr,
        "XOR" => Xor,
        "EQ" => Eq,
        "NEQ" => Neq,
        "GT" => Gt,
        "LT" => Lt,
        "GE" => Ge,
        "LE" => Le,
        "SDIVIDE" => SDivide,
        "SMOD" => SMod,
        _ => return Err(format!("unknown binary operator {:?}", s)),
    })
}

fn parse_cast(s: &str) -> ParseResult<ForeignCast> {
    use ForeignCast::*;
    Ok(match s {
        "UNSIGNED" => Unsigned,
        "SIGNED" => Signed,
        "HIGH" => High,
        "LOW" => Low,
        "FLOAT" => Float,
        "INTEGER" => Integer,
        "RFLOAT" => RFloat,
        "RINTEGER" => RInteger,
        _ => return Err(format!("unknown cast {:?}", s)),
    })
}

fn to_expr(e: &SExp) -> ParseResult<ForeignExpr> {
    let l = match e {
        SExp::List(l) => l,
        e => return Err(format!("expected an expression, got {:?}", e)),
    };
    let head = l.first().ok_or("empty expression")?.atom()?;
    let expr = |i: usize| to_expr(&l[i]).map(Box::new);
    let arity = |n: usize| {
        if l.len() == n + 1 {
            Ok(())
        } else {
            Err(format!("`{}` takes {} arguments, got {}", head, n, l.len() - 1))
        }
    };
    Ok(match head {
        "CONST" => {
            arity(2)?;
            ForeignExpr::Constant {
                value: parse_num(l[1].atom()?)?,
                width: parse_width(l[2].atom()?)?,
            }
        }
        "TEMP" => {
            arity(2)?;
            ForeignExpr::Temp {
                name: l[1].atom()?.to_owned(),
                width: parse_width(l[2].atom()?)?,
            }
        }
        "MEM" => {
            arity(2)?;
            ForeignExpr::Mem {
                addr: expr(1)?,
                width: parse_width(l[2].atom()?)?,
            }
        }
        "BINOP" => {
            arity(3)?;
            ForeignExpr::BinOp(parse_binop(l[1].atom()?)?, expr(2)?, expr(3)?)
        }
        "UNOP" => {
            arity(2)?;
            let op = match l[1].atom()? {
                "NEG" => ForeignUnOp::Neg,
                "NOT" => ForeignUnOp::Not,
                o => return Err(format!("unknown unary operator {:?}", o)),
            };
            ForeignExpr::UnOp(op, expr(2)?)
        }
        "CAST" => {
            arity(3)?;
            ForeignExpr::Cast {
                kind: parse_cast(l[1].atom()?)?,
                width: parse_width(l[2].atom()?)?,
                expr: expr(3)?,
            }
        }
        "NAME" => {
            arity(1)?;
            ForeignExpr::Name(l[1].atom()?.to_owned())
        }
        "UNKNOWN" => {
            arity(2)?;
            let description = match &l[1] {
                SExp::Str(s) => s.clone(),
                e => return Err(format!("expected a string, got {:?}", e)),
            };
            ForeignExpr::Unknown {
                description,
                width: parse_width(l[2].atom()?)?,
            }
        }
        "LET" => {
            arity(3)?;
            ForeignExpr::Let {
                var: expr(1)?,
                bound: expr(2)?,
                body: expr(3)?,
            }
        }
        "EXT" => {
            arity(1)?;
            ForeignExpr::Extension(l[1].atom()?.to_owned())
        }
        h => return Err(format!("unknown expression {:?}", h)),
    })
}

/// Parse a single expression such as `(BINOP PLUS (TEMP R_EAX 32) (CONST 0x4 32))`.
pub fn parse_expr(s: &str) -> ParseResult<ForeignExpr> {
    match &parse_sexps(s)?[..] {
        [e] => to_expr(e),
        es => Err(format!("expected one expression, got {}", es.len())),
    }
}

fn parse_exprs<const N: usize>(s: &str) -> ParseResult<[ForeignExpr; N]> {
    let es = parse_sexps(s)?
        .iter()
        .map(to_expr)
        .collect::<ParseResult<Vec<_>>>()?;
    let n = es.len();
    es.try_into()
        .map_err(|_| format!("expected {} expressions, got {}", N, n))
}

fn to_context(e: &SExp) -> ParseResult<ForeignContext> {
    let l = match e {
        SExp::List(l) if l.len() == 7 && l[0] == SExp::Atom("CTX".into()) => l,
        e => {
            return Err(format!(
                "expected `(CTX name mem|reg width index value taint)`, got {:?}",
                e
            ))
        }
    };
    Ok(ForeignContext {
        name: l[1].atom()?.to_owned(),
        is_memory: match l[2].atom()? {
            "mem" => true,
            "reg" => false,
            k => return Err(format!("expected `mem` or `reg`, got {:?}", k)),
        },
        width: match l[3].atom()? {
            "-" => None,
            w => Some(parse_width(w)?),
        },
        index: parse_num(l[4].atom()?)?,
        value: parse_num(l[5].atom()?)?,
        tainted: match l[6].atom()? {
            "tainted" => true,
            "untainted" => false,
            t => return Err(format!("expected `tainted` or `untainted`, got {:?}", t)),
        },
    })
}

/// Parse a single block statement (without its indentation).
pub fn parse_stmt(line: &str) -> ParseResult<ForeignStmt> {
    let (keyword, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    Ok(match keyword {
        "JMP" => {
            let [e] = parse_exprs::<1>(rest)?;
            ForeignStmt::Jmp(e)
        }
        "CJMP" => {
            let [c, t, f] = parse_exprs::<3>(rest)?;
            ForeignStmt::CJmp(c, t, f)
        }
        "SPECIAL" => ForeignStmt::Special(rest.to_owned()),
        "MOVE" => {
            let [lhs, rhs] = parse_exprs::<2>(rest)?;
            ForeignStmt::Move(lhs, rhs)
        }
        "COMMENT" => ForeignStmt::Comment(rest.to_owned()),
        "LABEL" => {
            let (name, contexts) = rest.split_once(' ').unwrap_or((rest, ""));
            if name.is_empty() {
                return Err("label without a name".into());
            }
            ForeignStmt::Label {
                name: name.to_owned(),
                contexts: parse_sexps(contexts)?
                    .iter()
                    .map(to_context)
                    .collect::<ParseResult<_>>()?,
            }
        }
        "ASSERT" => {
            let [e] = parse_exprs::<1>(rest)?;
            ForeignStmt::Assert(e)
        }
        "DECL" => match rest.split_whitespace().collect_tuple::<(_, _)>() {
            Some((name, width)) => ForeignStmt::VarDecl {
                name: name.to_owned(),
                width: parse_width(width)?,
            },
            None => return Err(format!("expected `DECL <name> <width>`, got {:?}", line)),
        },
        "EXP" => {
            let [e] = parse_exprs::<1>(rest)?;
            ForeignStmt::ExpStmt(e)
        }
        "CALL" => ForeignStmt::Call,
        "RETURN" => ForeignStmt::Return,
        "FUNC" => ForeignStmt::Func(rest.to_owned()),
        k => return Err(format!("unknown statement {:?}", k)),
    })
}
