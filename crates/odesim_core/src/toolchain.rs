//! External toolchain driver.
//!
//! Writes generated source, invokes the compiler for the target and, for the
//! native target, launches the resulting executable. Compiler and artifact
//! failures are reported, not raised: callers check
//! [`BuildReport::artifact_exists`].

use crate::codegen::{emit, EmitOptions, Target};
use crate::inputs::{Generator, InputConfig};
use crate::model::{InputBinding, ModelTables, SharedModel};
use crate::traits::SampleSource;
use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[cfg(target_os = "macos")]
const MEX_EXTENSION: &str = "mexmaci64";
#[cfg(target_os = "windows")]
const MEX_EXTENSION: &str = "mexw64";
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
const MEX_EXTENSION: &str = "mexa64";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub c_compiler: String,
    pub c_flags: Vec<String>,
    pub nvcc: String,
    pub nvcc_flags: Vec<String>,
    pub mex: String,
    pub output_dir: PathBuf,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            c_compiler: "cc".to_string(),
            c_flags: vec!["-O2".to_string(), "-ffp-contract=off".to_string()],
            nvcc: "nvcc".to_string(),
            nvcc_flags: vec!["-O2".to_string(), "--fmad=false".to_string()],
            mex: "mex".to_string(),
            output_dir: PathBuf::from("build"),
        }
    }
}

/// Runs external commands. Swapped out in tests.
pub trait ToolRunner: Send + Sync {
    fn run(&self, command: &mut Command) -> io::Result<Output>;
}

pub struct SystemRunner;

impl ToolRunner for SystemRunner {
    fn run(&self, command: &mut Command) -> io::Result<Output> {
        command.output()
    }
}

/// Where the artifact of `target` lands.
pub fn artifact_path(target: Target, model: &str, dir: &Path) -> PathBuf {
    let stem = target.stem(model);
    match target {
        Target::Native => dir.join(format!("{stem}{}", std::env::consts::EXE_SUFFIX)),
        Target::SharedObject => dir.join(format!(
            "{}{stem}{}",
            std::env::consts::DLL_PREFIX,
            std::env::consts::DLL_SUFFIX
        )),
        Target::Gpu | Target::GpuMeasure => dir.join(format!("{stem}.ptx")),
        Target::HostExtension | Target::HostExtensionMeasure => dir.join(format!("{stem}.{MEX_EXTENSION}")),
        Target::Companion | Target::CompanionMeasure => dir.join(target.source_file(model)),
    }
}

/// The compiler invocation for `target`, or `None` when the source is the
/// artifact.
pub fn compile_command(
    config: &ToolchainConfig,
    target: Target,
    model: &str,
    source: &Path,
    artifact: &Path,
) -> Option<Command> {
    match target {
        Target::Native | Target::SharedObject => {
            let mut command = Command::new(&config.c_compiler);
            command.args(&config.c_flags);
            if target == Target::SharedObject {
                command.args(["-shared", "-fPIC"]);
            }
            command.arg("-o").arg(artifact).arg(source).arg("-lm");
            Some(command)
        }
        Target::Gpu | Target::GpuMeasure => {
            let mut command = Command::new(&config.nvcc);
            command
                .args(&config.nvcc_flags)
                .arg("-ptx")
                .arg("-o")
                .arg(artifact)
                .arg(source);
            Some(command)
        }
        Target::HostExtension | Target::HostExtensionMeasure => {
            let mut command = Command::new(&config.mex);
            command.arg(format!("CFLAGS=$CFLAGS {}", config.c_flags.join(" ")));
            if let Some(dir) = artifact.parent() {
                command.arg("-outdir").arg(dir);
            }
            command.arg("-output").arg(target.stem(model)).arg(source);
            Some(command)
        }
        Target::Companion | Target::CompanionMeasure => None,
    }
}

/// Writes one sample file per generator referenced by `tables` and returns
/// the source key to path map expected by [`EmitOptions::input_files`].
pub fn materialize_inputs(
    tables: &ModelTables,
    config: &InputConfig,
    dir: &Path,
) -> Result<BTreeMap<String, PathBuf>> {
    let mut files = BTreeMap::new();
    for row in &tables.variables {
        if row.freeze {
            continue;
        }
        let Some(InputBinding::Generator(kind)) = row.input_binding() else {
            continue;
        };
        let generator = Generator {
            kind,
            config: config.clone(),
        };
        let key = generator.source_key();
        if files.contains_key(&key) {
            continue;
        }
        let path = dir.join(format!("{key}.samples"));
        generator
            .load()?
            .write_file(&path)
            .with_context(|| format!("failed to write samples to {}", path.display()))?;
        debug!(source = %key, path = %path.display(), "materialised input stream");
        files.insert(key, path);
    }
    Ok(files)
}

/// One generation pass.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub target: Target,
    pub options: EmitOptions,
    pub inputs: InputConfig,
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub target: Target,
    pub source: PathBuf,
    pub artifact: PathBuf,
    /// Compiler exit code; `None` when it could not be started or was
    /// killed by a signal.
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
    pub stderr: String,
    pub artifact_exists: bool,
}

impl BuildReport {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) && self.artifact_exists
    }
}

/// Emits, writes and compiles `request.target` for `tables`.
pub fn build(
    tables: &ModelTables,
    request: &BuildRequest,
    config: &ToolchainConfig,
    runner: &dyn ToolRunner,
) -> Result<BuildReport> {
    fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("failed to create {}", config.output_dir.display()))?;
    // Input paths are baked into the source and must be absolute.
    let dir = &fs::canonicalize(&config.output_dir)
        .with_context(|| format!("failed to resolve {}", config.output_dir.display()))?;

    let mut options = request.options.clone();
    if request.target.reads_input_files() {
        for (key, path) in materialize_inputs(tables, &request.inputs, dir)? {
            options.input_files.entry(key).or_insert(path);
        }
    }
    let text = emit(tables, &options, request.target)
        .with_context(|| format!("failed to generate {} source", request.target))?;
    let source = dir.join(request.target.source_file(&options.name));
    fs::write(&source, text).with_context(|| format!("failed to write {}", source.display()))?;

    let artifact = artifact_path(request.target, &options.name, dir);
    let Some(mut command) = compile_command(config, request.target, &options.name, &source, &artifact) else {
        info!(backend = %request.target, source = %source.display(), "wrote source");
        return Ok(BuildReport {
            target: request.target,
            artifact_exists: artifact.exists(),
            source,
            artifact,
            exit_code: Some(0),
            elapsed: Duration::ZERO,
            stderr: String::new(),
        });
    };
    if let Err(err) = fs::remove_file(&artifact) {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(artifact = %artifact.display(), "cannot remove stale artifact: {err}");
        }
    }

    let started = Instant::now();
    let (exit_code, stderr) = match runner.run(&mut command) {
        Ok(output) => (
            output.status.code(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ),
        Err(err) => (None, format!("cannot start {:?}: {err}", command.get_program())),
    };
    let elapsed = started.elapsed();
    let artifact_exists = artifact.exists();
    if exit_code == Some(0) {
        info!(backend = %request.target, elapsed_ms = elapsed.as_millis() as u64, "compiled {}", artifact.display());
    } else {
        warn!(
            backend = %request.target,
            code = ?exit_code,
            elapsed_ms = elapsed.as_millis() as u64,
            "compiler failed: {}",
            stderr.trim()
        );
    }
    Ok(BuildReport {
        target: request.target,
        source,
        artifact,
        exit_code,
        elapsed,
        stderr,
        artifact_exists,
    })
}

/// Arguments for one native run; empty `arguments` uses the defaults baked
/// into the executable.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub duration: f64,
    pub save_mod_n: u32,
    pub output: PathBuf,
    pub arguments: Vec<f64>,
}

/// Completion of a launched artifact.
#[derive(Debug, Clone)]
pub struct ArtifactEvent {
    pub artifact: PathBuf,
    pub output: PathBuf,
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
    pub stdout: String,
    pub stderr: String,
}

impl ArtifactEvent {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs a native executable to completion.
pub fn launch(artifact: &Path, request: &RunRequest, runner: &dyn ToolRunner) -> ArtifactEvent {
    let mut command = Command::new(artifact);
    command
        .arg(request.duration.to_string())
        .arg(request.save_mod_n.to_string())
        .arg(&request.output)
        .args(request.arguments.iter().map(|value| format!("{value:?}")));

    let started = Instant::now();
    let (exit_code, stdout, stderr) = match runner.run(&mut command) {
        Ok(output) => (
            output.status.code(),
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ),
        Err(err) => (None, String::new(), format!("cannot start {}: {err}", artifact.display())),
    };
    let elapsed = started.elapsed();
    if exit_code == Some(0) {
        info!(artifact = %artifact.display(), elapsed_ms = elapsed.as_millis() as u64, "artifact finished");
    } else {
        warn!(
            artifact = %artifact.display(),
            code = ?exit_code,
            elapsed_ms = elapsed.as_millis() as u64,
            "artifact failed: {}",
            stderr.trim()
        );
    }
    ArtifactEvent {
        artifact: artifact.to_path_buf(),
        output: request.output.clone(),
        exit_code,
        elapsed,
        stdout,
        stderr,
    }
}

/// Background generation. Each pass snapshots the current tables, so the
/// pipeline keeps no model state of its own; passes writing the same source
/// file are serialised.
#[derive(Clone)]
pub struct GenerationPipeline {
    config: ToolchainConfig,
    runner: Arc<dyn ToolRunner>,
    locks: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>>,
}

impl GenerationPipeline {
    pub fn new(config: ToolchainConfig) -> Self {
        Self::with_runner(config, Arc::new(SystemRunner))
    }

    pub fn with_runner(config: ToolchainConfig, runner: Arc<dyn ToolRunner>) -> Self {
        Self {
            config,
            runner,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &ToolchainConfig {
        &self.config
    }

    fn lock_for(&self, request: &BuildRequest) -> Arc<Mutex<()>> {
        let dir = &self.config.output_dir;
        // Keyed like `build` resolves it, so every spelling of a directory shares one lock.
        let dir = fs::create_dir_all(dir)
            .and_then(|()| fs::canonicalize(dir))
            .unwrap_or_else(|_| dir.clone());
        let source = dir.join(request.target.source_file(&request.options.name));
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(source).or_default())
    }

    /// Builds on the calling thread.
    pub fn build_now(&self, tables: &ModelTables, request: &BuildRequest) -> Result<BuildReport> {
        let lock = self.lock_for(request);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        build(tables, request, &self.config, self.runner.as_ref())
    }

    pub fn spawn_build(
        &self,
        model: &SharedModel,
        request: BuildRequest,
    ) -> io::Result<JoinHandle<Result<BuildReport>>> {
        let pipeline = self.clone();
        let model = model.clone();
        thread::Builder::new()
            .name("odesim-build".to_string())
            .spawn(move || pipeline.build_now(&model.snapshot(), &request))
    }

    /// Builds the native executable, then runs it and sends the completion
    /// to `events`. The handle yields the build report.
    pub fn spawn_run(
        &self,
        model: &SharedModel,
        request: BuildRequest,
        run: RunRequest,
        events: Sender<ArtifactEvent>,
    ) -> io::Result<JoinHandle<Result<BuildReport>>> {
        let pipeline = self.clone();
        let model = model.clone();
        thread::Builder::new()
            .name("odesim-run".to_string())
            .spawn(move || {
                ensure!(
                    request.target == Target::Native,
                    "only the native target can be launched, not {}",
                    request.target
                );
                let report = pipeline.build_now(&model.snapshot(), &request)?;
                if !report.artifact_exists {
                    warn!(artifact = %report.artifact.display(), "nothing to launch");
                    return Ok(report);
                }
                let event = launch(&report.artifact, &run, pipeline.runner.as_ref());
                if events.send(event).is_err() {
                    debug!("artifact event receiver dropped");
                }
                Ok(report)
            })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::codegen::EmitOptions;
    use crate::engine::EngineConfig;
    use crate::model::{Row, TableKind};
    use std::ffi::OsString;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use std::sync::mpsc::channel;

    /// Records every command and creates the file named after `-o`.
    #[derive(Default)]
    struct FakeRunner {
        calls: Mutex<Vec<Vec<OsString>>>,
        exit_code: i32,
    }

    impl ToolRunner for FakeRunner {
        fn run(&self, command: &mut Command) -> io::Result<Output> {
            let mut call = vec![command.get_program().to_os_string()];
            call.extend(command.get_args().map(|arg| arg.to_os_string()));
            if self.exit_code == 0 {
                if let Some(pos) = call.iter().position(|arg| arg == "-o") {
                    fs::write(&call[pos + 1], b"artifact")?;
                }
            }
            self.calls.lock().expect("calls").push(call);
            Ok(Output {
                status: ExitStatus::from_raw(self.exit_code << 8),
                stdout: Vec::new(),
                stderr: if self.exit_code == 0 { Vec::new() } else { b"syntax error".to_vec() },
            })
        }
    }

    fn decay() -> ModelTables {
        let mut tables = ModelTables::new();
        tables.push_state("x", "-x", "1").expect("x");
        tables
    }

    fn request(target: Target) -> BuildRequest {
        BuildRequest {
            target,
            options: EmitOptions::new("decay", &EngineConfig::default()),
            inputs: InputConfig::default(),
        }
    }

    fn config(dir: &Path) -> ToolchainConfig {
        ToolchainConfig {
            output_dir: dir.to_path_buf(),
            ..ToolchainConfig::default()
        }
    }

    #[test]
    fn native_build_invokes_the_c_compiler() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = FakeRunner::default();
        let report = build(&decay(), &request(Target::Native), &config(dir.path()), &runner).expect("build");

        assert!(report.succeeded());
        assert!(report.source.ends_with("decay.c"));
        assert!(fs::read_to_string(&report.source).expect("source").contains("int main("));
        let calls = runner.calls.lock().expect("calls");
        let args: Vec<String> = calls[0].iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args[0], "cc");
        assert!(args.contains(&"-ffp-contract=off".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("-lm"));
    }

    #[test]
    fn compiler_failure_is_reported_not_raised() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = FakeRunner {
            exit_code: 1,
            ..FakeRunner::default()
        };
        let report = build(&decay(), &request(Target::SharedObject), &config(dir.path()), &runner).expect("build");
        assert_eq!(report.exit_code, Some(1));
        assert!(!report.artifact_exists);
        assert_eq!(report.stderr, "syntax error");
        assert!(report.source.ends_with("decay_lib.c"));
    }

    #[test]
    fn companion_needs_no_compiler() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = FakeRunner::default();
        let report = build(&decay(), &request(Target::Companion), &config(dir.path()), &runner).expect("build");
        assert!(report.succeeded());
        assert_eq!(report.artifact, report.source);
        assert!(runner.calls.lock().expect("calls").is_empty());
    }

    #[test]
    fn generated_inputs_are_written_before_emitting() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut tables = decay();
        tables
            .push_row(TableKind::Variables, Row::new("noise", "normal"))
            .expect("noise");
        tables
            .push_row(TableKind::Variables, Row::new("noise2", "normal"))
            .expect("noise2");
        let inputs = InputConfig {
            buffer_len: 16,
            ..InputConfig::default()
        };
        let files = materialize_inputs(&tables, &inputs, dir.path()).expect("inputs");
        assert_eq!(files.len(), 1);
        let buffer = crate::inputs::SampleBuffer::read_file(&files["normal"]).expect("samples");
        assert_eq!(buffer.samples.len(), 16);

        let report = build(&tables, &request(Target::Native), &config(dir.path()), &FakeRunner::default())
            .expect("build");
        let source = fs::read_to_string(&report.source).expect("source");
        assert!(source.contains("normal.samples"), "{source}");
    }

    #[test]
    fn pipeline_builds_then_launches() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = Arc::new(FakeRunner::default());
        let pipeline = GenerationPipeline::with_runner(config(dir.path()), runner.clone());
        let model = SharedModel::new(decay());
        let (tx, rx) = channel();
        let run = RunRequest {
            duration: 1.0,
            save_mod_n: 2,
            output: dir.path().join("out.bin"),
            arguments: vec![3.0],
        };
        let handle = pipeline
            .spawn_run(&model, request(Target::Native), run, tx)
            .expect("spawn");
        let report = handle.join().expect("join").expect("build");
        assert!(report.succeeded());

        let event = rx.recv_timeout(Duration::from_secs(5)).expect("event");
        assert!(event.succeeded());
        let calls = runner.calls.lock().expect("calls");
        assert_eq!(calls.len(), 2);
        let launch: Vec<String> = calls[1].iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(&launch[1..3], ["1", "2"]);
        assert_eq!(launch.last().map(String::as_str), Some("3.0"));
    }

    #[test]
    fn lock_is_keyed_by_the_resolved_source_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("a")).expect("mkdir");
        let spelled = GenerationPipeline::with_runner(
            config(&dir.path().join("a").join("..").join("out")),
            Arc::new(FakeRunner::default()),
        );
        let plain = GenerationPipeline {
            config: config(&dir.path().join("out")),
            ..spelled.clone()
        };
        let first = spelled.lock_for(&request(Target::Native));
        let second = plain.lock_for(&request(Target::Native));
        assert!(Arc::ptr_eq(&first, &second));

        let resolved = fs::canonicalize(dir.path().join("out")).expect("canonical");
        let locks = spelled.locks.lock().expect("locks");
        assert_eq!(locks.len(), 1);
        assert!(locks.keys().all(|key| key.starts_with(&resolved)));
    }

    #[test]
    fn pipeline_refuses_to_launch_other_targets() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pipeline = GenerationPipeline::with_runner(config(dir.path()), Arc::new(FakeRunner::default()));
        let (tx, _rx) = channel();
        let run = RunRequest {
            duration: 1.0,
            save_mod_n: 1,
            output: dir.path().join("out.bin"),
            arguments: Vec::new(),
        };
        let handle = pipeline
            .spawn_run(&SharedModel::new(decay()), request(Target::Gpu), run, tx)
            .expect("spawn");
        assert!(handle.join().expect("join").is_err());
    }
}
