use odesim_core::codegen::{EmitOptions, Target};
use odesim_core::engine::{Engine, EngineConfig};
use odesim_core::formula::Scheme;
use odesim_core::inputs::InputConfig;
use odesim_core::model::{Condition, ModelTables, Row, TableKind};
use odesim_core::toolchain::{build, launch, BuildRequest, RunRequest, SystemRunner, ToolchainConfig};
use odesim_core::trajectory::Trajectory;
use std::process::Command;

fn have_c_compiler() -> bool {
    Command::new("cc")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn fitzhugh_nagumo() -> ModelTables {
    let mut tables = ModelTables::new();
    for (key, value) in [("a", "0.7"), ("b", "0.8"), ("eps", "0.08"), ("current", "0.5")] {
        tables
            .push_row(TableKind::Parameters, Row::new(key, value))
            .expect("parameter");
    }
    tables
        .push_row(TableKind::Variables, Row::new("noise", "normal"))
        .expect("noise");
    tables
        .push_row(TableKind::Variables, Row::new("drive", "current + 0.05*noise"))
        .expect("drive");
    tables
        .push_state("v", "v - v^3/3 - w + drive", "-1")
        .expect("v");
    tables.push_state("w", "eps*(v + a - b*w)", "1").expect("w");
    tables.push_condition(Condition::new("v > 1.8", &["w = w + 0.1"]));
    tables
}

fn assert_close(interpreted: &Trajectory, native: &Trajectory) {
    assert_eq!(interpreted.names(), native.names());
    assert_eq!(interpreted.num_records(), native.num_records());
    for field in 0..interpreted.num_fields() {
        let expected = interpreted.column_at(field).expect("interpreted column");
        let actual = native.column_at(field).expect("native column");
        for (record, (e, a)) in expected.iter().zip(actual).enumerate() {
            let tolerance = 1e-9 * e.abs().max(1.0);
            assert!(
                (e - a).abs() < tolerance,
                "{} record {record}: interpreter {e}, native {a}",
                interpreted.names()[field]
            );
        }
    }
}

#[test]
fn native_executable_matches_the_interpreter() {
    if !have_c_compiler() {
        eprintln!("skipping: no C compiler on PATH");
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let tables = fitzhugh_nagumo();
    let duration = 20.0;
    let save_mod_n = 10;

    for scheme in [Scheme::Euler, Scheme::Heun, Scheme::Rk4] {
        let config = EngineConfig {
            model_step: 0.01,
            scheme,
            inputs: InputConfig {
                buffer_len: 1000,
                samples_per_unit_time: 50,
                seed: 7,
            },
            ..EngineConfig::default()
        };
        let mut engine = Engine::new(config.clone());
        let interpreted = engine
            .run(&tables, config.iterations_for(duration), save_mod_n)
            .expect("interpreter run");

        let toolchain = ToolchainConfig {
            output_dir: dir.path().join(scheme.to_string()),
            ..ToolchainConfig::default()
        };
        let request = BuildRequest {
            target: Target::Native,
            options: EmitOptions::new("fhn", &config),
            inputs: config.inputs.clone(),
        };
        let report = build(&tables, &request, &toolchain, &SystemRunner).expect("build");
        assert!(report.succeeded(), "compiler failed: {}", report.stderr);

        let output = dir.path().join(format!("fhn_{scheme}.bin"));
        let event = launch(
            &report.artifact,
            &RunRequest {
                duration,
                save_mod_n,
                output: output.clone(),
                arguments: Vec::new(),
            },
            &SystemRunner,
        );
        assert!(event.succeeded(), "artifact failed: {}", event.stderr);

        let native = Trajectory::read_file(&output).expect("trajectory");
        assert_close(&interpreted, &native);
    }
}

#[test]
fn explicit_arguments_override_the_defaults() {
    if !have_c_compiler() {
        eprintln!("skipping: no C compiler on PATH");
        return;
    }
    let dir = tempfile::tempdir().expect("tempdir");
    let mut tables = ModelTables::new();
    tables
        .push_row(TableKind::Parameters, Row::new("k", "1"))
        .expect("k");
    tables.push_state("x", "-k*x", "1").expect("x");
    let config = EngineConfig {
        model_step: 0.1,
        ..EngineConfig::default()
    };
    let toolchain = ToolchainConfig {
        output_dir: dir.path().to_path_buf(),
        ..ToolchainConfig::default()
    };
    let request = BuildRequest {
        target: Target::Native,
        options: EmitOptions::new("decay", &config),
        inputs: InputConfig::default(),
    };
    let report = build(&tables, &request, &toolchain, &SystemRunner).expect("build");
    assert!(report.succeeded(), "compiler failed: {}", report.stderr);

    let output = dir.path().join("decay.bin");
    let event = launch(
        &report.artifact,
        &RunRequest {
            duration: 0.2,
            save_mod_n: 1,
            output: output.clone(),
            arguments: vec![2.0, 3.0],
        },
        &SystemRunner,
    );
    assert!(event.succeeded(), "artifact failed: {}", event.stderr);
    let native = Trajectory::read_file(&output).expect("trajectory");
    let x = native.column("x").expect("x");
    // k = 2, x0 = 3: 3 * 0.8, then 3 * 0.8 * 0.8.
    assert_eq!(x.len(), 2);
    assert!((x[0] - 2.4).abs() < 1e-12);
    assert!((x[1] - 1.92).abs() < 1e-12);
}
