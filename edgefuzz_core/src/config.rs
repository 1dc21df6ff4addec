use crate::constants::EXEC_TIMEOUT;
use crate::error::FuzzError;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigInputDelivery {
    #[default]
    StdIn,
    File {
        template: String,
    },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CommandExecutorSettings {
    pub command: Vec<String>,
    #[serde(default)]
    pub input_delivery: ConfigInputDelivery,
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_crash_on_nonzero_exit")]
    pub crash_on_nonzero_exit: bool,
}

fn default_crash_on_nonzero_exit() -> bool {
    true
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorType {
    InProcess,
    #[default]
    Command,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub executor_type: ExecutorType,
    #[serde(default)]
    pub command_settings: Option<CommandExecutorSettings>,
}

/// Deterministic-stage sharding across cooperating instances (`index` is 1-based).
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DetShard {
    pub index: u32,
    pub count: u32,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    #[serde(default = "default_input_dir")]
    pub input_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    pub extras: Option<PathBuf>,
    /// Fixed execution timeout; auto-scaled from the seeds when absent.
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub skip_timeouts: bool,
    pub hang_timeout_ms: Option<u64>,
    #[serde(default)]
    pub skip_crashes: bool,
    #[serde(default)]
    pub skip_deterministic: bool,
    #[serde(default)]
    pub dumb_mode: bool,
    #[serde(default)]
    pub crash_mode: bool,
    #[serde(default)]
    pub no_arith: bool,
    #[serde(default)]
    pub fast_cal: bool,
    #[serde(default)]
    pub ignore_finds: bool,
    #[serde(default)]
    pub shuffle_queue: bool,
    #[serde(default)]
    pub simple_files: bool,
    #[serde(default)]
    pub resume: bool,
    pub fuzz_bitmap: Option<PathBuf>,
    pub target_file: Option<PathBuf>,
    pub banner: Option<String>,
    pub seed: Option<u64>,
    pub max_cycles: Option<u64>,
    pub max_execs: Option<u64>,
    #[serde(default = "default_stats_update_secs")]
    pub stats_update_secs: u64,
    pub det_shard: Option<DetShard>,
}

pub fn default_input_dir() -> PathBuf {
    PathBuf::from("in")
}

pub fn default_output_dir() -> PathBuf {
    PathBuf::from("out")
}

pub fn default_stats_update_secs() -> u64 {
    60
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            input_dir: default_input_dir(),
            output_dir: default_output_dir(),
            extras: None,
            timeout_ms: None,
            skip_timeouts: false,
            hang_timeout_ms: None,
            skip_crashes: false,
            skip_deterministic: false,
            dumb_mode: false,
            crash_mode: false,
            no_arith: false,
            fast_cal: false,
            ignore_finds: false,
            shuffle_queue: false,
            simple_files: false,
            resume: false,
            fuzz_bitmap: None,
            target_file: None,
            banner: None,
            seed: None,
            max_cycles: None,
            max_execs: None,
            stats_update_secs: default_stats_update_secs(),
            det_shard: None,
        }
    }
}

impl FuzzerSettings {
    /// Rejects combinations the engine cannot run with.
    pub fn validate(&self) -> Result<(), FuzzError> {
        if !self.resume && self.input_dir == self.output_dir {
            return Err(FuzzError::SameInputOutput(self.input_dir.clone()));
        }
        if self.crash_mode && self.dumb_mode {
            return Err(FuzzError::MutuallyExclusive("crash-mode", "dumb-mode"));
        }
        if let Some(shard) = self.det_shard {
            if shard.count == 0 || shard.index == 0 || shard.index > shard.count {
                return Err(FuzzError::InvalidSetting(format!(
                    "det-shard index {} out of range 1..={}",
                    shard.index, shard.count
                )));
            }
        }
        if self.timeout_ms == Some(0) {
            return Err(FuzzError::InvalidSetting(
                "timeout-ms must be positive".to_string(),
            ));
        }
        if self.skip_timeouts && self.timeout_ms.is_none() {
            return Err(FuzzError::InvalidSetting(
                "skip-timeouts requires an explicit timeout-ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Timeout used to confirm hangs.
    pub fn hang_timeout(&self) -> u64 {
        self.hang_timeout_ms.unwrap_or(EXEC_TIMEOUT)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct EdgefuzzConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl EdgefuzzConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: EdgefuzzConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let text = r#"
[fuzzer]
input-dir = "seeds"
output-dir = "findings"
timeout-ms = 200
skip-timeouts = true
dumb-mode = true
max-execs = 5000
det-shard = { index = 2, count = 4 }

[executor]
executor-type = "command"
[executor.command-settings]
command = ["./target", "@@"]
input-delivery = { file = { template = "@@" } }
crash-on-nonzero-exit = false
"#;
        let config: EdgefuzzConfig = toml::from_str(text).unwrap();
        assert_eq!(config.fuzzer.input_dir, PathBuf::from("seeds"));
        assert_eq!(config.fuzzer.timeout_ms, Some(200));
        assert!(config.fuzzer.dumb_mode);
        assert_eq!(config.fuzzer.stats_update_secs, 60);
        assert_eq!(
            config.fuzzer.det_shard,
            Some(DetShard { index: 2, count: 4 })
        );
        let cmd = config.executor.command_settings.unwrap();
        assert_eq!(
            cmd.input_delivery,
            ConfigInputDelivery::File {
                template: "@@".to_string()
            }
        );
        assert!(!cmd.crash_on_nonzero_exit);
        assert!(config.fuzzer.validate().is_ok());
    }

    #[test]
    fn rejects_unknown_keys() {
        let text = "[fuzzer]\nnot-a-setting = 1\n";
        assert!(toml::from_str::<EdgefuzzConfig>(text).is_err());
    }

    #[test]
    fn validation_catches_conflicts() {
        let mut settings = FuzzerSettings {
            output_dir: PathBuf::from("in"),
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(FuzzError::SameInputOutput(_))
        ));

        settings.output_dir = PathBuf::from("out");
        settings.crash_mode = true;
        settings.dumb_mode = true;
        assert!(matches!(
            settings.validate(),
            Err(FuzzError::MutuallyExclusive("crash-mode", "dumb-mode"))
        ));

        settings.dumb_mode = false;
        settings.det_shard = Some(DetShard { index: 0, count: 2 });
        assert!(matches!(
            settings.validate(),
            Err(FuzzError::InvalidSetting(_))
        ));
    }

    #[test]
    fn load_from_file_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[fuzzer\n").unwrap();
        assert!(EdgefuzzConfig::load_from_file(&path).is_err());

        std::fs::write(&path, "[fuzzer]\nresume = true\n").unwrap();
        let config = EdgefuzzConfig::load_from_file(&path).unwrap();
        assert!(config.fuzzer.resume);
        assert_eq!(config.executor.executor_type, ExecutorType::Command);
    }
}
