use asmir::*;

use std::path::PathBuf;

use clap::Parser;

use crate::config::{LiftConfig, CONFIG};
use crate::exported::ExportedProgram;
use crate::foreign::{Lifter, LifterHandle, NoFastPath};
use crate::scope::Scope;
use crate::trace::{TraceError, TraceReader};

/// Lower lifted binaries into a small intermediate language, and inspect execution traces
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Lower a lifter export into the IR
    Lift {
        /// Path to a lifter export file
        export: PathBuf,
        /// Lower the instructions in `[START, END)` one at a time instead of the whole export
        #[clap(long, number_of_values = 2, value_names = &["START", "END"], parse(try_from_str = parse_address))]
        range: Option<Vec<u64>>,
        /// Print the function ranges computed from the symbol table instead of lowering
        #[clap(long)]
        function_ranges: bool,
        /// Path to write the output to, instead of stdout
        #[clap(long)]
        output: Option<PathBuf>,
        #[clap(flatten)]
        logging: LogArgs,
        /// Advanced configuration options to tweak lowering
        #[clap(short = 'Z', long, arg_enum)]
        advanced_config: Vec<config::CommandLineLiftConfig>,
    },
    /// Decode and print an execution trace
    DumpTrace {
        /// Path to a trace file
        trace: PathBuf,
        /// Print at most this many instruction entries
        #[clap(long)]
        limit: Option<usize>,
        /// Path to write the output to, instead of stdout
        #[clap(long)]
        output: Option<PathBuf>,
        #[clap(flatten)]
        logging: LogArgs,
    },
}

#[derive(clap::Args, Debug)]
struct LogArgs {
    /// Disable terminal logging, even for high severity alerts. Strongly discouraged for normal
    /// use.
    #[clap(long)]
    debug_disable_terminal_logging: bool,
    /// Force blocking for terminal logging. If too many messages are being spewed the logger,
    /// by default, does not block, but instead dumps a dropped-messages alert. This option
    /// forces it to block and dump even if too many are being sent.
    #[clap(long)]
    debug_forced_blocking_terminal_logging: bool,
    /// Path to send log (as JSON) to
    ///
    /// Error or higher severity alerts will still continue being shown at stderr (in addition
    /// to being added to the log)
    #[clap(long = "log")]
    log_file: Option<PathBuf>,
    /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
    #[clap(short, long, parse(from_occurrences))]
    debug: usize,
}

fn parse_address(s: &str) -> Result<u64, std::num::ParseIntError> {
    u64::from_str_radix(s.strip_prefix("0x").unwrap_or(s), 16)
}

fn lift(
    export: PathBuf,
    range: Option<Vec<u64>>,
    function_ranges: bool,
) -> Result<String, Box<dyn std::error::Error>> {
    use std::fmt::Write;

    let exported: ExportedProgram = std::fs::read_to_string(export)
        .expect("Export file could not be read")
        .parse()?;
    let mut scope = Scope::for_arch(exported.arch);
    let mut handle = LifterHandle::open(exported);
    let mut out = String::new();

    if function_ranges {
        for r in materialize::function_ranges(handle.get()?)? {
            writeln!(out, "{} {:#x} {:#x}", r.name, r.start, r.end)?;
        }
    } else if let Some(range) = range {
        let fragments =
            lower::lower_range(&mut scope, &NoFastPath, handle.get()?, range[0], range[1])?;
        for stmts in fragments {
            for s in stmts {
                writeln!(out, "{}", s)?;
            }
        }
    } else {
        let blocks = handle.get()?.blocks()?;
        let prog =
            lower::lower_program(&mut scope, &blocks, CONFIG.attach_disassembly_to_block_labels)?;
        let prog = if CONFIG.materialize_read_only_data {
            materialize::read_only_data(handle.get()?, scope.mem(), prog)?
        } else {
            prog
        };
        log::info!("Lowered program"; "stmts" => prog.len());
        write!(out, "{}", prog)?;
    }

    handle.release();
    Ok(out)
}

fn dump_trace(path: PathBuf, limit: Option<usize>) -> Result<String, Box<dyn std::error::Error>> {
    use std::fmt::Write;

    let file = std::io::BufReader::new(std::fs::File::open(path).map_err(TraceError::Io)?);
    let reader = TraceReader::new(file)?;
    let mut out = String::new();

    let h = reader.header();
    writeln!(
        out,
        "gdt {:#x} idt {:#x} procs {}",
        h.gdt_base,
        h.idt_base,
        h.procs.len()
    )?;
    for p in &h.procs {
        writeln!(out, "proc {} pid {} ldt {:#x}", p.name, p.pid, p.ldt_base)?;
        for m in &p.modules {
            writeln!(out, "  module {} {:#x}+{:#x}", m.name, m.base, m.size)?;
        }
    }

    for e in reader.take(limit.unwrap_or(usize::MAX)) {
        let e = e?;
        writeln!(
            out,
            "{:#010x} tid {} tp {:?} bytes {:02x?}",
            e.address, e.tid, e.tp, e.raw
        )?;
        for o in &e.operands {
            writeln!(
                out,
                "  {:?} {:?} len {} addr {:#x} value {:#x} tainted {:#b} {:?}",
                o.kind, o.usage, o.length, o.addr, o.value, o.tainted, o.access
            )?;
        }
    }
    Ok(out)
}

fn write_output(output: Option<PathBuf>, s: &str) {
    if let Some(path) = output {
        std::fs::write(path, s).expect("Output file could not be written");
    } else {
        print!("{}", s);
    }
}

fn main() {
    let args = Args::parse();

    let logging = match &args {
        Args::Lift { logging, .. } | Args::DumpTrace { logging, .. } => logging,
    };
    let logger = log::FileAndTermDrain::new(
        logging.debug,
        logging.debug_disable_terminal_logging,
        logging.debug_forced_blocking_terminal_logging,
        logging.log_file.clone(),
    )
    .expect("Logger could not be set up");

    let ok = {
        let _log_guard = slog_scope::set_global_logger(logger);

        match args {
            Args::Lift {
                export,
                range,
                function_ranges,
                output,
                logging: _,
                advanced_config,
            } => {
                LiftConfig::initialize(advanced_config);
                match lift(export, range, function_ranges) {
                    Ok(s) => {
                        write_output(output, &s);
                        true
                    }
                    Err(e) => {
                        log::crit!("Lifting failed"; "error" => %e);
                        false
                    }
                }
            }
            Args::DumpTrace {
                trace,
                limit,
                output,
                logging: _,
            } => match dump_trace(trace, limit) {
                Ok(s) => {
                    write_output(output, &s);
                    true
                }
                Err(e) => {
                    log::crit!("Reading trace failed"; "error" => %e);
                    false
                }
            },
        }
    };

    log::trace!("Done");
    if !ok {
        std::process::exit(1);
    }
}
