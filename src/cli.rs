//! CLI argument parsing for kdscope

use crate::config::MachineConfig;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use regex::Regex;
use std::path::PathBuf;

/// Output format for window summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "kdscope")]
#[command(version)]
#[command(about = "Reconstruct machine execution history from kdebug traces", long_about = None)]
pub struct Cli {
    /// Enable debug tracing output to stderr
    #[arg(long)]
    pub debug: bool,

    /// Reconstruction config file (TOML)
    #[arg(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print trace layout and reconstruction counts
    Info {
        /// RAW trace file
        trace: PathBuf,
    },

    /// Summarize CPU, process and thread activity over a window
    Summary {
        /// RAW trace file
        trace: PathBuf,

        /// Window start (absolute time units; default: trace start)
        #[arg(long, value_name = "NS")]
        start: Option<u64>,

        /// Window end (absolute time units; default: trace end)
        #[arg(long, value_name = "NS")]
        end: Option<u64>,

        /// Restrict the summary to one CPU
        #[arg(long, value_name = "N")]
        cpu: Option<u32>,

        /// Only report processes whose name matches
        #[arg(long, value_name = "REGEX")]
        process: Option<String>,

        /// Output format (text or json)
        #[arg(long = "format", value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// List every event with its owning process
    Events {
        /// RAW trace file
        trace: PathBuf,

        /// Render workers
        #[arg(long, value_name = "N", default_value = "4")]
        workers: usize,
    },
}

impl Cli {
    /// Configuration from `--config`, or the defaults.
    pub fn machine_config(&self) -> Result<MachineConfig> {
        let config = match &self.config {
            Some(path) => MachineConfig::from_toml(path)?,
            None => MachineConfig::default(),
        };
        config.validate().context("Invalid reconstruction config")?;
        Ok(config)
    }
}

/// Compile a `--process` pattern.
pub fn process_filter(pattern: Option<&str>) -> Result<Option<Regex>> {
    pattern
        .map(|p| Regex::new(p).with_context(|| format!("Invalid --process regex: {}", p)))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_info() {
        let cli = Cli::parse_from(["kdscope", "info", "trace.raw"]);
        assert!(!cli.debug);
        match cli.command {
            Command::Info { trace } => assert_eq!(trace, PathBuf::from("trace.raw")),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_summary_defaults() {
        let cli = Cli::parse_from(["kdscope", "summary", "t.raw"]);
        match cli.command {
            Command::Summary {
                start,
                end,
                cpu,
                process,
                format,
                ..
            } => {
                assert!(start.is_none() && end.is_none());
                assert!(cpu.is_none());
                assert!(process.is_none());
                assert_eq!(format, OutputFormat::Text);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_summary_window_and_filters() {
        let cli = Cli::parse_from([
            "kdscope", "--debug", "summary", "t.raw", "--start", "100", "--end", "200", "--cpu",
            "3", "--process", "^Safari$", "--format", "json",
        ]);
        assert!(cli.debug);
        match cli.command {
            Command::Summary {
                start,
                end,
                cpu,
                process,
                format,
                ..
            } => {
                assert_eq!((start, end, cpu), (Some(100), Some(200), Some(3)));
                assert_eq!(process.as_deref(), Some("^Safari$"));
                assert_eq!(format, OutputFormat::Json);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_events_workers() {
        let cli = Cli::parse_from(["kdscope", "events", "t.raw", "--workers", "8"]);
        match cli.command {
            Command::Events { workers, .. } => assert_eq!(workers, 8),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_config_after_subcommand() {
        let cli = Cli::parse_from(["kdscope", "info", "t.raw", "--config", "kd.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("kd.toml")));
    }

    #[test]
    fn test_default_machine_config() {
        let cli = Cli::parse_from(["kdscope", "info", "t.raw"]);
        assert_eq!(cli.machine_config().unwrap(), MachineConfig::default());
    }

    #[test]
    fn test_process_filter() {
        assert!(process_filter(None).unwrap().is_none());
        let re = process_filter(Some("^log")).unwrap().unwrap();
        assert!(re.is_match("logd"));
        assert!(process_filter(Some("(")).is_err());
    }
}
