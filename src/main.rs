use clap::{Parser, Subcommand};
use savedinfo::protect::{FileReport, ProtectError, ProtectOptions, Protector, DEFAULT_SIDECAR_DIR};
use savedinfo::{HeapPool, RedundancyModel};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit status when at least one file has blocks that cannot be restored.
const EXIT_DATA_LOST: u8 = 2;

#[derive(Parser)]
#[command(name = "savedinfo", version, about = "Create, test and repair .chk saved info records")]
struct Cli {
    /// Log as JSON lines instead of plain text
    #[arg(long, global = true)]
    log_json: bool,
    /// trace, debug, info, warn or error (RUST_LOG overrides per target)
    #[arg(long, global = true, default_value = "info")]
    log_level: Level,
    /// Directory next to each file that holds its record
    #[arg(long, global = true, default_value = DEFAULT_SIDECAR_DIR)]
    sidecar_dir: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build saved info for each file
    Create {
        #[arg(required = true, num_args = 1..)]
        files: Vec<PathBuf>,
    },
    /// Check each file against its saved info without modifying anything
    Test {
        #[arg(required = true, num_args = 1..)]
        files: Vec<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Restore damaged blocks in place and refresh the saved info
    Repair {
        #[arg(required = true, num_args = 1..)]
        files: Vec<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Show what a .chk record contains
    Info {
        record: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Patch two records of identical files from each other
    Reconcile {
        first:  PathBuf,
        second: PathBuf,
    },
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(&cli);

    let opts = ProtectOptions { sidecar_dir: cli.sidecar_dir.clone(), ..ProtectOptions::default() };
    let protector = Protector::new(opts);

    match cli.command {

        // ── Create ───────────────────────────────────────────────────────────
        Commands::Create { files } => {
            let results = protector.for_each_file(&files, |p, f| p.create_saved_info(f));
            let mut failed = false;
            for (path, result) in files.iter().zip(results) {
                match result {
                    Ok(chk) => println!("  created {}", chk.display()),
                    Err(e) => {
                        error!(file = %path.display(), error = %e, "could not create saved info");
                        failed = true;
                    }
                }
            }
            Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
        }

        // ── Test ─────────────────────────────────────────────────────────────
        Commands::Test { files, json } => {
            let results = protector.for_each_file(&files, |p, f| p.test_file(f).map(|c| c.report));
            print_reports(&files, results, json)
        }

        // ── Repair ───────────────────────────────────────────────────────────
        Commands::Repair { files, json } => {
            let results = protector.for_each_file(&files, |p, f| p.repair_file(f));
            print_reports(&files, results, json)
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { record, json } => {
            let mut f = std::fs::File::open(&record)?;
            let model = RedundancyModel::read_from(&mut f, &HeapPool)?;
            let s = model.summary();
            if json {
                println!("{}", serde_json::to_string_pretty(&s)?);
            } else {
                println!("── Saved info ───────────────────────────────────────────");
                println!("  Path            {}", record.display());
                println!("  File length     {} B", s.file_length);
                println!("  Modified (UTC)  {}", s.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"));
                println!("  Rows            {:?}", s.row_lengths);
                println!("  Checksums       {}", s.checksum_count);
                println!("  Unreadable      {} slot(s)", s.unreadable_slots);
                println!("  Metadata        {}", if s.metadata_damaged { "damaged" } else { "intact" });
                println!("  Overhead        {} B", s.overhead_bytes);
                if let Some(first) = model.checksums().first() {
                    println!("  First checksum  {}", hex::encode(first));
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        // ── Reconcile ────────────────────────────────────────────────────────
        Commands::Reconcile { first, second } => {
            if protector.reconcile_records(&first, &second)? {
                println!("Reconciled {} and {}", first.display(), second.display());
            } else {
                println!("Nothing to exchange");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn init_logging(cli: &Cli) {
    let filter = EnvFilter::from_default_env().add_directive(cli.log_level.into());

    if cli.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

fn print_reports(
    files:   &[PathBuf],
    results: Vec<Result<FileReport, ProtectError>>,
    json:    bool,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut reports = Vec::with_capacity(results.len());
    let mut failed = false;
    for (path, result) in files.iter().zip(results) {
        match result {
            Ok(report) => {
                if !json {
                    println!("  {}", report.summary());
                }
                reports.push(report);
            }
            Err(e) => {
                error!(file = %path.display(), error = %e, "could not check file");
                failed = true;
            }
        }
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    }

    let lost = reports.iter().any(|r| r.blocks_unrecoverable > 0);
    Ok(if lost {
        ExitCode::from(EXIT_DATA_LOST)
    } else if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_is_parsed_not_guessed() {
        let cli = Cli::try_parse_from(["savedinfo", "--log-level", "DEBUG", "test", "f"]).unwrap();
        assert_eq!(cli.log_level, Level::DEBUG);
        assert!(Cli::try_parse_from(["savedinfo", "--log-level", "verbose", "test", "f"]).is_err());
    }
}
