//! tdyn CLI: implicit transient dynamics from JSON run files.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod models;

use commands::{DemoModel, OutputFormat};

#[derive(Parser)]
#[command(name = "tdyn-cli")]
#[command(version, about = "Implicit trapezoidal transient analysis of linear structures")]
struct Cli {
    /// Log debug output (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the analysis described by a JSON run file.
    Run {
        /// Path to the run file.
        config: PathBuf,

        /// Output file (stdout when omitted).
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Csv)]
        format: OutputFormat,
    },

    /// Run a built-in model.
    Demo {
        #[arg(value_enum)]
        model: DemoModel,

        /// End time (s); each model has its own default.
        #[arg(long)]
        t_end: Option<f64>,

        #[arg(short, long)]
        output: Option<PathBuf>,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Csv)]
        format: OutputFormat,
    },

    /// Lump the model and report the stable step estimate without integrating.
    Check {
        /// Path to the run file.
        config: PathBuf,
    },
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Run {
            config,
            output,
            format,
        } => commands::run(&config, output.as_deref(), format),
        Commands::Demo {
            model,
            t_end,
            output,
            format,
        } => commands::demo(model, t_end, output.as_deref(), format),
        Commands::Check { config } => commands::check(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(1)
        }
    }
}
