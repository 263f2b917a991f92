use clap::{Parser, Subcommand};
use romscan::definition::Definitions;
use romscan::pointer;
use romscan::scan::{Candidates, ScanOptions, Scanner};
use romscan::{DecodedRecord, Schema, ScanStats};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "romscan", about = "Find schema-shaped structures in GBA ROM images")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report every offset where the schema decodes
    Scan {
        rom: PathBuf,
        /// JSON schema definition file
        #[arg(short, long)]
        schema: PathBuf,
        /// Schema to scan for (defaults to the file's root)
        #[arg(short, long)]
        root: Option<String>,
        /// Candidate alignment in bytes
        #[arg(short, long, default_value = "4")]
        align: usize,
        /// Only try offsets that some pointer in the ROM refers to
        #[arg(long)]
        pointer_targets: bool,
        /// Worker threads (default: one per core)
        #[arg(short = 'j', long)]
        threads: Option<usize>,
        /// Emit JSON instead of one offset per line
        #[arg(long)]
        json: bool,
        /// Include decoded records in JSON output
        #[arg(long)]
        records: bool,
    },
    /// Decode one record and print it as JSON
    Decode {
        rom: PathBuf,
        #[arg(short, long)]
        schema: PathBuf,
        #[arg(short, long)]
        root: Option<String>,
        /// Offset in hex; ROM addresses (0x08xxxxxx) are accepted
        #[arg(short, long, value_parser = parse_offset)]
        offset: usize,
    },
    /// List offsets that valid pointers refer to
    Targets {
        rom: PathBuf,
        #[arg(short, long, default_value = "4")]
        align: usize,
        /// How many targets to print
        #[arg(short, long, default_value = "16")]
        limit: usize,
    },
}

#[derive(Serialize)]
struct ScanReport<'a> {
    schema:  &'a str,
    stats:   &'a ScanStats,
    matches: Vec<MatchOut<'a>>,
}

#[derive(Serialize)]
struct MatchOut<'a> {
    offset: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<&'a DecodedRecord>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    match Cli::parse().command {

        // ── Scan ─────────────────────────────────────────────────────────────
        Commands::Scan { rom, schema, root, align, pointer_targets, threads, json, records } => {
            let data = std::fs::read(&rom)?;
            let defs = Definitions::load(&schema)?;
            let target = pick(&defs, &root)?;

            let opts = ScanOptions {
                candidates: if pointer_targets { Candidates::PointerTargets } else { Candidates::Aligned(align) },
                keep_records: json && records,
                threads,
                ..ScanOptions::default()
            };
            let result = Scanner::new(opts).scan(&data, target);
            tracing::info!(
                rom = %rom.display(),
                schema = target.name(),
                matches = result.stats.matches,
                candidates = result.stats.candidates,
                "scan complete"
            );

            if json {
                let report = ScanReport {
                    schema:  target.name(),
                    stats:   &result.stats,
                    matches: result
                        .matches
                        .iter()
                        .map(|(offset, record)| MatchOut {
                            offset: format!("0x{offset:06X}"),
                            record: record.as_ref(),
                        })
                        .collect(),
                };
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                for offset in result.offsets() {
                    println!("0x{offset:06X}");
                }
            }
        }

        // ── Decode ───────────────────────────────────────────────────────────
        Commands::Decode { rom, schema, root, offset } => {
            let data = std::fs::read(&rom)?;
            let defs = Definitions::load(&schema)?;
            let target = pick(&defs, &root)?;
            let record = romscan::decode(&data, offset, target)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }

        // ── Targets ──────────────────────────────────────────────────────────
        Commands::Targets { rom, align, limit } => {
            let data = std::fs::read(&rom)?;
            let targets = pointer::pointer_targets(&data, align);
            println!("{} pointer target(s) in {}", targets.len(), rom.display());
            for offset in targets.iter().take(limit) {
                println!("  0x{offset:06X}");
            }
        }
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr).try_init();
}

fn pick<'a>(defs: &'a Definitions, root: &Option<String>) -> Result<&'a Schema, romscan::DefinitionError> {
    match root {
        Some(name) => defs.schema(name),
        None => defs.root(),
    }
}

/// Hex file offset, or a ROM bus address as written in pointers.
fn parse_offset(s: &str) -> Result<usize, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    let value = u32::from_str_radix(digits, 16).map_err(|e| format!("bad offset `{s}`: {e}"))?;
    match (value >> 24) as u8 {
        0 | pointer::ROM_BANK_0 | pointer::ROM_BANK_1 => Ok((value & pointer::OFFSET_MASK) as usize),
        bank => Err(format!("bad offset `{s}`: bank 0x{bank:02x} is not a ROM bank")),
    }
}
