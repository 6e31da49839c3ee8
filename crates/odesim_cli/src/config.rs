use anyhow::{Context, Result};
use odesim_core::engine::EngineConfig;
use odesim_core::toolchain::ToolchainConfig;
use odesim_core::worker::WorkerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Settings read from `config.toml`. Every section is optional.
///
/// ```toml
/// [engine]
/// model_step = 0.005
/// scheme = "rk4"
///
/// [engine.inputs]
/// seed = 42
///
/// [toolchain]
/// c_compiler = "clang"
/// output_dir = "generated"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub engine: EngineConfig,
    pub toolchain: ToolchainConfig,
    pub worker: WorkerConfig,
}

/// `~/.odesim/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs_next::home_dir().map(|home| home.join(".odesim").join("config.toml"))
}

/// An explicit path must exist; the default location may be absent.
pub fn load(explicit: Option<&Path>) -> Result<CliConfig> {
    match explicit {
        Some(path) => read(path),
        None => match default_config_path() {
            Some(path) if path.exists() => read(&path),
            _ => Ok(CliConfig::default()),
        },
    }
}

fn read(path: &Path) -> Result<CliConfig> {
    let text = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let config: CliConfig = toml::from_str(&text).with_context(|| format!("invalid config {}", path.display()))?;
    tracing::debug!(path = %path.display(), "loaded config");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use odesim_core::formula::Scheme;

    #[test]
    fn partial_sections_keep_defaults() {
        let config: CliConfig = toml::from_str(
            r#"
            [engine]
            scheme = "rk4"

            [engine.inputs]
            seed = 42

            [toolchain]
            c_compiler = "clang"
            "#,
        )
        .expect("parse");
        assert_eq!(config.engine.scheme, Scheme::Rk4);
        assert_eq!(config.engine.model_step, EngineConfig::default().model_step);
        assert_eq!(config.engine.inputs.seed, 42);
        assert_eq!(config.engine.inputs.buffer_len, 10_000);
        assert_eq!(config.toolchain.c_compiler, "clang");
        assert_eq!(config.toolchain.c_flags, ToolchainConfig::default().c_flags);
        assert_eq!(config.worker, WorkerConfig::default());
    }

    #[test]
    fn loads_an_explicit_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("odesim.toml");
        fs::write(&path, "[worker]\niterations_per_batch = 50\n").expect("write");
        let config = load(Some(&path)).expect("load");
        assert_eq!(config.worker.iterations_per_batch, 50);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = load(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(format!("{err:#}").contains("failed to read"));
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert!(toml::from_str::<CliConfig>("[engine]\nscheme = \"midpoint\"\n").is_err());
    }
}
