//! MFM: Map Feature Modifier
//!
//! Usage: mfm <COMMAND> [OPTIONS]

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::thread;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mfm_gcode::commands::{detect_line_ending, ProcessCommand};
use mfm_gcode::config::{Configuration, LineEnding, UserOptions};
use mfm_gcode::gcode::{GcodeError, Result};
use mfm_gcode::status::StatusItem;

#[derive(Parser)]
#[command(name = "mfm")]
#[command(version)]
#[command(about = "MFM: Map Feature Modifier - add isoline bands and replacement colors to multi-color G-code", long_about = None)]
struct Cli {
    /// Log debug details of every layer
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Rewrite a G-code file
    Process {
        /// Input G-code file
        input: PathBuf,

        /// Output file (default: overwrite the input)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Options JSON file with isoline and replacement color settings
        #[arg(short = 'c', long)]
        options: PathBuf,

        /// Minimal toolchange G-code template
        #[arg(short = 't', long)]
        toolchange: PathBuf,

        /// Line ending of synthesized lines
        #[arg(long, value_enum, default_value = "auto")]
        line_ending: LineEnding,

        /// Print rewrite statistics to stderr
        #[arg(long)]
        stats: bool,
    },

    /// Print the line ending of a G-code file
    DetectLineEnding {
        /// Input G-code file
        input: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Process {
            input,
            output,
            options,
            toolchange,
            line_ending,
            stats,
        } => run_process(input, output, options, toolchange, line_ending, stats),

        Commands::DetectLineEnding { input } => run_detect_line_ending(input),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            "mfm_gcode=debug,mfm=debug"
        } else {
            "mfm_gcode=info,mfm=info"
        })
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}

fn run_process(
    input: PathBuf,
    output: Option<PathBuf>,
    options: PathBuf,
    toolchange: PathBuf,
    line_ending: LineEnding,
    stats: bool,
) -> Result<()> {
    let options = UserOptions::from_path(&options)?;

    // Without an output path the result replaces the input once complete.
    let (output_path, in_place) = match output {
        Some(path) => (path, None),
        None => {
            let temp = temp_output(&input)?;
            (temp.path().to_path_buf(), Some(temp))
        }
    };

    let config = Configuration::new(input.clone(), output_path, toolchange)
        .with_options(&options)
        .with_line_ending(line_ending);
    let cmd = ProcessCommand::new(config);

    let (tx, rx) = crossbeam_channel::unbounded::<StatusItem>();
    let worker = thread::spawn(move || {
        for item in rx {
            log_status(&item);
        }
    });

    let result = cmd.run(&tx);
    drop(tx);
    if worker.join().is_err() {
        warn!("status worker panicked");
    }
    let result = result?;

    if let Some(temp) = in_place {
        temp.persist(&input).map_err(|e| GcodeError::Open {
            path: input.clone(),
            source: e.error,
        })?;
    }
    if stats {
        eprintln!("Process stats: {}", result);
    }
    Ok(())
}

fn temp_output(input: &Path) -> Result<tempfile::NamedTempFile> {
    let dir = input
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    tempfile::Builder::new()
        .prefix(".mfm-")
        .suffix(".gcode")
        .tempfile_in(dir)
        .map_err(|source| GcodeError::Open {
            path: dir.to_path_buf(),
            source,
        })
}

fn log_status(item: &StatusItem) {
    match (&item.left, &item.right, item.progress) {
        (Some(left), Some(right), Some(progress)) => info!("{left} | {right} ({progress:.1}%)"),
        (None, Some(right), Some(progress)) => info!("{right} ({progress:.1}%)"),
        (Some(left), Some(right), None) => info!("{left} | {right}"),
        (None, Some(right), None) => info!("{right}"),
        (Some(left), None, _) => info!("{left}"),
        (None, None, _) => {}
    }
}

fn run_detect_line_ending(input: PathBuf) -> Result<()> {
    let detected = detect_line_ending(&input)?;
    println!("{}", detected);
    Ok(())
}
