//! Coprocess configuration.

use std::path::Path;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use serde::Serialize;

use crate::codec::DataFormat;
use crate::error::ExecdError;
use crate::error::ExecdResult;

pub const DEFAULT_RESTART_DELAY: Duration = Duration::from_secs(10);
pub const MIN_RESTART_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Everything needed to run one supervised coprocess.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecdConfig {
    /// identity used in logs, defaults to the program's file name
    pub name: String,
    /// program followed by its arguments
    pub command: Vec<String>,
    /// `KEY=VALUE` entries added to the inherited environment
    pub environment: Vec<String>,
    /// unset or zero selects the default delay
    pub restart_delay_ms: Option<u64>,
    pub stop_timeout_ms: u64,
    pub queue_capacity: usize,
    /// outputs the child emits per input, `0` when outputs are unrelated to inputs
    pub outputs_per_input: u32,
    pub data_format: DataFormat,
}

impl Default for ExecdConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            command: Vec::new(),
            environment: Vec::new(),
            restart_delay_ms: None,
            stop_timeout_ms: DEFAULT_STOP_TIMEOUT.as_millis() as u64,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            outputs_per_input: 1,
            data_format: DataFormat::default(),
        }
    }
}

impl ExecdConfig {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.environment
            .push(format!("{}={}", key.as_ref(), value.as_ref()));
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay_ms = Some(delay.as_millis() as u64);
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_outputs_per_input(mut self, outputs: u32) -> Self {
        self.outputs_per_input = outputs;
        self
    }

    pub fn with_data_format(mut self, format: DataFormat) -> Self {
        self.data_format = format;
        self
    }

    pub fn program(&self) -> Option<&str> {
        self.command.first().map(String::as_str)
    }

    pub fn args(&self) -> &[String] {
        self.command.get(1..).unwrap_or_default()
    }

    pub fn display_name(&self) -> &str {
        if !self.name.is_empty() {
            return &self.name;
        }
        self.program()
            .map(|program| {
                Path::new(program)
                    .file_name()
                    .and_then(|name| name.to_str())
                    .unwrap_or(program)
            })
            .unwrap_or("execd")
    }

    /// Effective delay between a crash and the next spawn.
    pub fn restart_delay(&self) -> Duration {
        match self.restart_delay_ms {
            None | Some(0) => DEFAULT_RESTART_DELAY,
            Some(ms) => Duration::from_millis(ms).max(MIN_RESTART_DELAY),
        }
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Splits the environment entries into key/value pairs.
    pub fn env_pairs(&self) -> ExecdResult<Vec<(String, String)>> {
        self.environment
            .iter()
            .map(|entry| match entry.split_once('=') {
                Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
                _ => Err(Report::new(ExecdError::Config {
                    message: format!("environment entry `{entry}` is not KEY=VALUE"),
                })),
            })
            .collect()
    }

    pub fn validate(&self) -> ExecdResult<()> {
        match self.program() {
            None => {
                return Err(Report::new(ExecdError::Config {
                    message: "command must not be empty".to_string(),
                }));
            }
            Some("") => {
                return Err(Report::new(ExecdError::Config {
                    message: "program path must not be empty".to_string(),
                }));
            }
            Some(_) => {}
        }
        if self.queue_capacity == 0 {
            return Err(Report::new(ExecdError::Config {
                message: "queue_capacity must be at least 1".to_string(),
            }));
        }
        self.env_pairs()?;
        Ok(())
    }

    pub fn from_yaml_str(yaml: &str) -> ExecdResult<Self> {
        let config: Self = serde_yaml::from_str(yaml).change_context(ExecdError::Config {
            message: "malformed YAML".to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> ExecdResult<Self> {
        let path = path.as_ref();
        let context = || ExecdError::ConfigLoad {
            path: path.display().to_string(),
        };
        let yaml = std::fs::read_to_string(path).change_context_lazy(context)?;
        Self::from_yaml_str(&yaml).change_context_lazy(context)
    }
}
