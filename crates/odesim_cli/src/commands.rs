use crate::cli::Command;
use crate::config::CliConfig;
use anyhow::{bail, ensure, Context, Result};
use odesim_core::codegen::{emit, EmitOptions, Target};
use odesim_core::engine::Engine;
use odesim_core::inputs::SampleBuffer;
use odesim_core::log::{LogLevel, LogSink};
use odesim_core::model::{ModelTables, SharedModel, TableKind};
use odesim_core::toolchain::{materialize_inputs, BuildRequest, GenerationPipeline, RunRequest};
use odesim_core::trajectory::Trajectory;
use odesim_core::worker::SimulationWorker;
use std::fs;
use std::path::Path;
use std::sync::mpsc::channel;
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

const LIVE_PRINT_INTERVAL: Duration = Duration::from_millis(500);

pub fn dispatch(cmd: Command, mut config: CliConfig) -> Result<()> {
    match cmd {
        Command::Simulate {
            model,
            duration,
            save_every,
            out,
            measure,
            intervals,
            target,
            live,
        } => {
            let tables = load_model(&model)?;
            if let Some(seconds) = live {
                return simulate_live(tables, &config, seconds);
            }
            if let Some(field) = measure {
                let mut engine = Engine::new(config.engine.clone());
                let rmse = engine.measure(&tables, &field, &intervals, &target)?;
                println!("{rmse}");
                return Ok(());
            }
            let mut engine = Engine::new(config.engine.clone());
            let iterations = engine.iterations_for(duration);
            let trajectory = engine.run(&tables, iterations, save_every)?;
            info!(
                iterations,
                records = trajectory.num_records(),
                scheme = %config.engine.scheme,
                "simulation finished"
            );
            match out {
                Some(path) => trajectory
                    .write_file(&path)
                    .with_context(|| format!("failed to write {}", path.display()))?,
                None => print_trajectory(&trajectory, usize::MAX),
            }
            Ok(())
        }
        Command::Emit {
            model,
            target,
            name,
            measure_field,
            out,
        } => {
            let tables = load_model(&model)?;
            let mut options = EmitOptions::new(model_name(&model, name)?, &config.engine);
            options.measure_field = measure_field;
            if target.reads_input_files() {
                let dir = &config.toolchain.output_dir;
                fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
                let dir = fs::canonicalize(dir)?;
                options.input_files = materialize_inputs(&tables, &config.engine.inputs, &dir)?;
            }
            let source = emit(&tables, &options, target)?;
            match out {
                Some(path) => fs::write(&path, source).with_context(|| format!("failed to write {}", path.display()))?,
                None => print!("{source}"),
            }
            Ok(())
        }
        Command::Build {
            model,
            target,
            name,
            measure_field,
            out_dir,
        } => {
            let tables = load_model(&model)?;
            if let Some(dir) = out_dir {
                config.toolchain.output_dir = dir;
            }
            let mut options = EmitOptions::new(model_name(&model, name)?, &config.engine);
            options.measure_field = measure_field;
            let request = BuildRequest {
                target,
                options,
                inputs: config.engine.inputs.clone(),
            };
            let report = GenerationPipeline::new(config.toolchain).build_now(&tables, &request)?;
            println!("source   {}", report.source.display());
            if !report.succeeded() {
                bail!(
                    "{} build failed (exit {:?}): {}",
                    report.target,
                    report.exit_code,
                    report.stderr.trim()
                );
            }
            if report.artifact != report.source {
                println!(
                    "artifact {} ({} ms)",
                    report.artifact.display(),
                    report.elapsed.as_millis()
                );
            }
            Ok(())
        }
        Command::Run {
            model,
            duration,
            save_every,
            out,
            args,
            name,
            out_dir,
        } => {
            let tables = load_model(&model)?;
            if let Some(dir) = out_dir {
                config.toolchain.output_dir = dir;
            }
            let request = BuildRequest {
                target: Target::Native,
                options: EmitOptions::new(model_name(&model, name)?, &config.engine),
                inputs: config.engine.inputs.clone(),
            };
            let run = RunRequest {
                duration,
                save_mod_n: save_every,
                output: out,
                arguments: args,
            };
            let (tx, rx) = channel();
            let pipeline = GenerationPipeline::new(config.toolchain);
            let handle = pipeline.spawn_run(&SharedModel::new(tables), request, run, tx)?;
            let report = match handle.join() {
                Ok(report) => report?,
                Err(_) => bail!("build thread panicked"),
            };
            ensure!(
                report.succeeded(),
                "native build failed (exit {:?}): {}",
                report.exit_code,
                report.stderr.trim()
            );
            let event = rx.recv().context("artifact did not report completion")?;
            if !event.stdout.is_empty() {
                print!("{}", event.stdout);
            }
            ensure!(
                event.succeeded(),
                "artifact failed (exit {:?}): {}",
                event.exit_code,
                event.stderr.trim()
            );
            let trajectory = Trajectory::read_file(&event.output)
                .with_context(|| format!("failed to read {}", event.output.display()))?;
            println!(
                "{} records of {} fields in {} ms -> {}",
                trajectory.num_records(),
                trajectory.num_fields(),
                event.elapsed.as_millis(),
                event.output.display()
            );
            Ok(())
        }
        Command::Inspect { file, records } => inspect(&file, records),
    }
}

fn load_model(path: &Path) -> Result<ModelTables> {
    ModelTables::load(path).with_context(|| format!("failed to load model {}", path.display()))
}

/// Explicit name, or the model file stem.
fn model_name(model: &Path, name: Option<String>) -> Result<String> {
    let name = match name {
        Some(name) => name,
        None => model
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(|stem| stem.replace(|c: char| !c.is_ascii_alphanumeric() && c != '_', "_"))
            .context("cannot derive a model name from the file name, pass --name")?,
    };
    ensure!(
        name.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'),
        "model name `{name}` must be an identifier"
    );
    Ok(name)
}

fn simulate_live(tables: ModelTables, config: &CliConfig, seconds: f64) -> Result<()> {
    ensure!(seconds.is_finite() && seconds > 0.0, "--live needs a positive duration");
    let log = LogSink::new();
    let mut worker = SimulationWorker::spawn(
        SharedModel::new(tables),
        config.engine.clone(),
        config.worker.clone(),
        log.clone(),
    )?;
    let deadline = Instant::now() + Duration::from_secs_f64(seconds);
    let mut header_printed = false;
    while Instant::now() < deadline && worker.is_running() {
        thread::sleep(LIVE_PRINT_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
        if let Some(snapshot) = worker.latest() {
            if !header_printed {
                println!("iteration\t{}", snapshot.names.join("\t"));
                header_printed = true;
            }
            println!("{}\t{}", snapshot.iteration, join_values(&snapshot.values));
        }
    }
    worker.stop();
    let failed = log.entries().iter().any(|entry| entry.level == LogLevel::Error);
    ensure!(!failed, "simulation stopped with errors");
    Ok(())
}

fn inspect(file: &Path, records: usize) -> Result<()> {
    match file.extension().and_then(|ext| ext.to_str()) {
        Some("json") => {
            let tables = load_model(file)?;
            for kind in TableKind::ALL {
                let rows = tables.rows(kind);
                if rows.is_empty() {
                    continue;
                }
                println!("{kind}:");
                for row in rows {
                    let freeze = if row.freeze { " (frozen)" } else { "" };
                    println!("  {} = {}{freeze}", row.key, row.expression);
                }
            }
            if !tables.conditions.is_empty() {
                println!("conditions:");
                for condition in &tables.conditions {
                    println!("  if {}: {}", condition.test, condition.results.join("; "));
                }
            }
            Ok(())
        }
        Some("samples") => {
            let buffer = SampleBuffer::read_file(file)
                .with_context(|| format!("failed to read samples {}", file.display()))?;
            let count = buffer.samples.len() as f64;
            let mean = buffer.samples.iter().sum::<f64>() / count;
            let variance = buffer.samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / count;
            println!(
                "{} samples at {} per unit time, mean {mean:.6}, std {:.6}",
                buffer.samples.len(),
                buffer.samples_per_unit_time,
                variance.sqrt()
            );
            Ok(())
        }
        _ => {
            let trajectory = Trajectory::read_file(file)
                .with_context(|| format!("failed to read trajectory {}", file.display()))?;
            println!(
                "{} records of {} fields, saved every {} iterations",
                trajectory.num_records(),
                trajectory.num_fields(),
                trajectory.save_mod_n()
            );
            print_trajectory(&trajectory, records);
            Ok(())
        }
    }
}

fn print_trajectory(trajectory: &Trajectory, limit: usize) {
    println!("{}", trajectory.names().join("\t"));
    for index in 0..trajectory.num_records().min(limit) {
        if let Some(record) = trajectory.record(index) {
            println!("{}", join_values(&record));
        }
    }
}

fn join_values(values: &[f64]) -> String {
    values.iter().map(|v| format!("{v:.9}")).collect::<Vec<_>>().join("\t")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_name_defaults_to_a_sanitised_stem() {
        assert_eq!(model_name(Path::new("models/fitz-hugh.json"), None).unwrap(), "fitz_hugh");
        assert_eq!(model_name(Path::new("x.json"), Some("neuron".into())).unwrap(), "neuron");
        assert!(model_name(Path::new("1model.json"), None).is_err());
        assert!(model_name(Path::new("m.json"), Some("bad name".into())).is_err());
    }

    #[test]
    fn inspect_reads_a_written_trajectory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.bin");
        let mut trajectory = Trajectory::new(vec!["x".into()], 1);
        trajectory.push_record(&[1.0]);
        trajectory.write_file(&path).expect("write");
        inspect(&path, 5).expect("inspect");
    }
}
