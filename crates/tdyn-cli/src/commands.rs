//! CLI command implementations.

use crate::models::RunFile;
use chrono::Utc;
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use tdyn_solver::step_estimate::DEFAULT_SAFETY_MULTIPLIER;
use tdyn_solver::{
    FullState, MassLumper, ResponseExtractor, ResponseSeries, StableStepEstimator, TimeStepSpec,
    TransientAnalysis, TransientResults, Unforced,
};
use tracing::info;

type CommandResult = Result<(), Box<dyn std::error::Error>>;

/// Output layout for the recorded series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// `time,value` rows
    Csv,
    /// Full report with run metadata
    Json,
}

/// Built-in demonstration models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DemoModel {
    Oscillator,
    Bar,
}

/// JSON report written with `--format json`.
#[derive(Serialize)]
struct Report<'a, T> {
    generated_at: String,
    run: &'a RunFile,
    results: &'a TransientResults<T>,
}

/// CSV output for the series types the CLI records.
trait CsvSeries {
    fn write_csv_to(&self, writer: &mut dyn Write) -> tdyn_solver::Result<()>;
}

impl CsvSeries for ResponseSeries<f64> {
    fn write_csv_to(&self, writer: &mut dyn Write) -> tdyn_solver::Result<()> {
        self.write_csv(writer)
    }
}

impl CsvSeries for ResponseSeries<Vec<f64>> {
    fn write_csv_to(&self, writer: &mut dyn Write) -> tdyn_solver::Result<()> {
        self.write_csv(writer)
    }
}

/// Run the job described by a JSON run file.
pub fn run(config_path: &Path, output: Option<&Path>, format: OutputFormat) -> CommandResult {
    let run_file = RunFile::load(config_path)?;
    info!(path = %config_path.display(), "loaded run file");
    execute(&run_file, output, format)
}

/// Run one of the built-in models.
pub fn demo(
    model: DemoModel,
    t_end: Option<f64>,
    output: Option<&Path>,
    format: OutputFormat,
) -> CommandResult {
    let run_file = match model {
        DemoModel::Oscillator => RunFile::oscillator_demo(t_end.unwrap_or(2.0 * std::f64::consts::PI)),
        DemoModel::Bar => RunFile::bar_demo(t_end.unwrap_or(0.01)),
    };
    execute(&run_file, output, format)
}

/// Lump the model and estimate its step without integrating.
pub fn check(config_path: &Path) -> CommandResult {
    let run_file = RunFile::load(config_path)?;
    let model = run_file.model.build()?;
    let lumped = MassLumper.lump(&model.mass)?;

    let multiplier = match run_file.analysis.time_step {
        TimeStepSpec::Estimated { safety_multiplier } => safety_multiplier,
        TimeStepSpec::Fixed { .. } => DEFAULT_SAFETY_MULTIPLIER,
    };
    let eigen = run_file.analysis.eigen;
    let estimate = StableStepEstimator::new(multiplier)
        .with_budget(eigen.max_iterations, eigen.tolerance)
        .estimate(&model.stiffness, &lumped)?;

    println!("dofs:               {}", run_file.model.num_dofs());
    println!("total mass:         {:.6e}", lumped.total());
    println!("constrained mass:   {:.6e}", lumped.constrained);
    println!("lambda_max:         {:.6e}", estimate.lambda_max);
    println!("omega_max:          {:.6e}", estimate.omega_max());
    println!("lanczos iterations: {}", estimate.iterations);
    println!("estimated dt:       {:.6e} (s = {multiplier})", estimate.time_step);
    Ok(())
}

fn execute(run_file: &RunFile, output: Option<&Path>, format: OutputFormat) -> CommandResult {
    match run_file.response {
        Some(response) => simulate(run_file, response, output, format),
        None => simulate(run_file, FullState, output, format),
    }
}

fn simulate<E>(
    run_file: &RunFile,
    extractor: E,
    output: Option<&Path>,
    format: OutputFormat,
) -> CommandResult
where
    E: ResponseExtractor,
    E::Output: Serialize,
    ResponseSeries<E::Output>: CsvSeries,
{
    let model = run_file.model.build()?;
    let analysis = TransientAnalysis::new(run_file.analysis.clone());
    let initial = run_file.initial_conditions();

    let results = match run_file.load {
        Some(load) => analysis.run(&model.mass, &model.stiffness, &initial, load, extractor)?,
        None => analysis.run(&model.mass, &model.stiffness, &initial, Unforced, extractor)?,
    };

    if let Some(energy) = &results.energy
        && let (Some(first), Some(last)) = (energy.first(), energy.last())
    {
        info!(initial = first.value, last = last.value, "discrete energy");
    }

    match output {
        Some(path) => {
            let mut writer = BufWriter::new(File::create(path)?);
            write_results(run_file, &results, format, &mut writer)?;
            writer.flush()?;
            info!(path = %path.display(), samples = results.response.len(), "wrote results");
        }
        None => {
            let stdout = io::stdout();
            let mut writer = stdout.lock();
            write_results(run_file, &results, format, &mut writer)?;
        }
    }
    Ok(())
}

fn write_results<T>(
    run_file: &RunFile,
    results: &TransientResults<T>,
    format: OutputFormat,
    writer: &mut dyn Write,
) -> CommandResult
where
    T: Serialize,
    ResponseSeries<T>: CsvSeries,
{
    match format {
        OutputFormat::Csv => results.response.write_csv_to(writer)?,
        OutputFormat::Json => {
            let report = Report {
                generated_at: Utc::now().to_rfc3339(),
                run: run_file,
                results,
            };
            serde_json::to_writer_pretty(&mut *writer, &report)?;
            writeln!(writer)?;
        }
    }
    Ok(())
}
