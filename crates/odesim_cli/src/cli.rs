use clap::{ArgAction, Parser, Subcommand};
use odesim_core::codegen::Target;
use odesim_core::formula::Scheme;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "odesim",
    about = "Simulate Model Tables, generate C/CUDA/MATLAB sources and build them",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Global: path to config (TOML); default: ~/.odesim/config.toml
    #[arg(long = "config", value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Global: debug logging for odesim crates
    #[arg(short = 'v', long = "verbose", action = ArgAction::SetTrue, global = true)]
    pub verbose: bool,

    /// Global: integration scheme (euler, heun, rk4)
    #[arg(long = "scheme", value_name = "SCHEME", global = true)]
    pub scheme: Option<Scheme>,

    /// Global: model step
    #[arg(long = "step", value_name = "DT", global = true)]
    pub step: Option<f64>,

    /// Global: seed for generated input streams
    #[arg(long = "seed", global = true)]
    pub seed: Option<u64>,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a saved model with the interpreter
    ///
    /// Examples:
    ///   odesim simulate neuron.json --duration 100 -o neuron.bin
    ///   odesim simulate neuron.json --measure v --intervals 10,10 --target -60,-55
    Simulate {
        #[arg(value_name = "MODEL")]
        model: PathBuf,
        #[arg(long, default_value = "10")]
        duration: f64,
        /// Keep every N-th iteration
        #[arg(long = "save-every", default_value = "1")]
        save_every: u32,
        /// Trajectory file to write
        #[arg(short = 'o', long = "out", value_name = "FILE")]
        out: Option<PathBuf>,
        /// Report the interval RMSE of this field instead of a trajectory
        #[arg(long, value_name = "FIELD", requires_all = ["intervals", "target"])]
        measure: Option<String>,
        #[arg(long, value_delimiter = ',', value_name = "N,..")]
        intervals: Vec<u64>,
        #[arg(long, value_delimiter = ',', value_name = "X,..", allow_hyphen_values = true)]
        target: Vec<f64>,
        /// Step on a background worker for this many seconds, printing snapshots
        #[arg(long, value_name = "SECONDS", conflicts_with_all = ["out", "measure"])]
        live: Option<f64>,
    },
    /// Print generated source for one target
    Emit {
        #[arg(value_name = "MODEL")]
        model: PathBuf,
        #[arg(short = 't', long = "target", default_value = "native")]
        target: Target,
        /// Model name used for functions and files; defaults to the file stem
        #[arg(long)]
        name: Option<String>,
        /// Field compared by measure targets
        #[arg(long = "measure-field", value_name = "FIELD")]
        measure_field: Option<String>,
        #[arg(short = 'o', long = "out", value_name = "FILE")]
        out: Option<PathBuf>,
    },
    /// Generate and compile one target
    Build {
        #[arg(value_name = "MODEL")]
        model: PathBuf,
        #[arg(short = 't', long = "target", default_value = "native")]
        target: Target,
        #[arg(long)]
        name: Option<String>,
        #[arg(long = "measure-field", value_name = "FIELD")]
        measure_field: Option<String>,
        /// Directory for sources and artifacts
        #[arg(long = "out-dir", value_name = "DIR")]
        out_dir: Option<PathBuf>,
    },
    /// Build the native executable and run it
    Run {
        #[arg(value_name = "MODEL")]
        model: PathBuf,
        #[arg(long, default_value = "10")]
        duration: f64,
        #[arg(long = "save-every", default_value = "1")]
        save_every: u32,
        #[arg(short = 'o', long = "out", value_name = "FILE")]
        out: PathBuf,
        /// Parameter then initial-condition values; defaults when omitted
        #[arg(long, value_delimiter = ',', value_name = "X,..", allow_hyphen_values = true)]
        args: Vec<f64>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long = "out-dir", value_name = "DIR")]
        out_dir: Option<PathBuf>,
    },
    /// Describe a saved model, trajectory file or input sample file
    Inspect {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        /// Records to print from a trajectory
        #[arg(long, default_value = "5")]
        records: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simulate_with_measure() {
        let cli = Cli::try_parse_from([
            "odesim",
            "simulate",
            "m.json",
            "--measure",
            "v",
            "--intervals",
            "10,0,5",
            "--target",
            "-60,-55.5,1",
            "--scheme",
            "rk4",
        ])
        .expect("parse");
        assert_eq!(cli.scheme, Some(Scheme::Rk4));
        match cli.cmd {
            Command::Simulate {
                measure,
                intervals,
                target,
                ..
            } => {
                assert_eq!(measure.as_deref(), Some("v"));
                assert_eq!(intervals, vec![10, 0, 5]);
                assert_eq!(target, vec![-60.0, -55.5, 1.0]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_targets_by_name() {
        let cli = Cli::try_parse_from(["odesim", "emit", "m.json", "-t", "gpu-measure"]).expect("parse");
        assert!(matches!(
            cli.cmd,
            Command::Emit {
                target: Target::GpuMeasure,
                ..
            }
        ));
        assert!(Cli::try_parse_from(["odesim", "emit", "m.json", "-t", "fortran"]).is_err());
    }

    #[test]
    fn measure_needs_intervals_and_target() {
        assert!(Cli::try_parse_from(["odesim", "simulate", "m.json", "--measure", "v"]).is_err());
    }
}
