use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use execd::DataFormat;
use execd::ExecdConfig;

use crate::report;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "execd",
    about = "Pipe metrics from stdin through an external program and print the results",
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub run: RunArgs,

    #[arg(
        long,
        help = "Print min/max aggregates of the output every N milliseconds"
    )]
    pub minmax_period_ms: Option<u64>,

    #[arg(
        long,
        env = "EXECD_DIAGNOSTICS_LOG",
        value_hint = clap::ValueHint::FilePath,
        help = "Write the program's stderr to this daily rotated file instead of the console"
    )]
    pub diagnostics_log: Option<PathBuf>,
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    #[arg(
        long,
        env = "EXECD_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        conflicts_with = "command",
        help = "YAML configuration file, replaces all other process options"
    )]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Name used in logs, defaults to the program's file name")]
    pub name: Option<String>,

    #[arg(
        short = 'e',
        long = "env",
        value_name = "KEY=VALUE",
        help = "Environment variable added for the program, may be repeated"
    )]
    pub environment: Vec<String>,

    #[arg(long, help = "Delay before restarting a crashed program, 0 selects 10s")]
    pub restart_delay_ms: Option<u64>,

    #[arg(
        long,
        default_value_t = 5000,
        help = "Grace period for the program to exit on shutdown"
    )]
    pub stop_timeout_ms: u64,

    #[arg(long, default_value_t = 1000, help = "Metrics buffered for the program")]
    pub queue_capacity: usize,

    #[arg(
        long,
        default_value_t = 1,
        help = "Outputs the program emits per input, 0 if they are unrelated"
    )]
    pub outputs_per_input: u32,

    #[arg(long, default_value_t = DataFormat::Influx, help = "Wire format: influx or json")]
    pub data_format: DataFormat,

    #[arg(
        last = true,
        value_name = "PROGRAM",
        help = "Program to run followed by its arguments"
    )]
    pub command: Vec<String>,
}

impl From<RunArgs> for ExecdConfig {
    fn from(args: RunArgs) -> Self {
        ExecdConfig {
            name: args.name.unwrap_or_default(),
            command: args.command,
            environment: args.environment,
            restart_delay_ms: args.restart_delay_ms,
            stop_timeout_ms: args.stop_timeout_ms,
            queue_capacity: args.queue_capacity,
            outputs_per_input: args.outputs_per_input,
            data_format: args.data_format,
        }
    }
}

impl RunArgs {
    /// Loads the YAML file if one was given, otherwise maps the flags.
    pub fn into_config(self) -> Result<ExecdConfig> {
        let config = match &self.config {
            Some(path) => ExecdConfig::from_yaml_file(path).map_err(report)?,
            None => ExecdConfig::from(self),
        };
        config.validate().map_err(report)?;
        Ok(config)
    }
}

impl Cli {
    pub fn minmax_period(&self) -> Option<Duration> {
        self.minmax_period_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}
