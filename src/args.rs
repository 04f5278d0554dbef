// Commandline argument parser using clap for lightlogger

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::{
    config::RunConfig,
    error::Result,
    sensor::SensorKind,
};

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct LoggerArgs {
    #[command(subcommand, long_about)]
    /// Which role to run: the orchestrator, a single sensor controller, or
    /// the offline chunk reader
    pub command: CommandTask,
}

#[derive(Debug, Subcommand, Clone)]
pub enum CommandTask {
    /// Launch one controller per sensor and capture synchronized bursts
    #[command(about)]
    Run(RunCommand),

    /// Run a single sensor controller; launched by `run`
    #[command(about)]
    Controller(ControllerCommand),

    /// Parse a chunk file and summarize every sensor in it
    #[command(about)]
    Inspect(InspectCommand),
}

#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// RON run configuration; defaults are used when absent
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of bursts to capture
    #[arg(short = 'n', long = "bursts")]
    pub burst_count: Option<u64>,

    /// Length of one burst, in milliseconds
    #[arg(short, long = "duration-ms")]
    pub duration_ms: Option<u64>,

    /// Directory the chunks are written to
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Directory holding the READY/GO/STOP marker areas
    #[arg(long)]
    pub rendezvous: Option<PathBuf>,

    /// Only run these sensors
    #[arg(short, long, value_enum, num_args = 1..)]
    pub sensors: Vec<SensorKind>,

    /// Burst index to start at; by default continues after the last chunk
    #[arg(long)]
    pub resume: Option<u64>,

    /// How long to wait for every controller to report ready, in milliseconds
    #[arg(long)]
    pub ready_timeout_ms: Option<u64>,

    /// Run controllers as threads of this process instead of child processes
    #[arg(long)]
    pub threads: bool,
}

impl RunCommand {
    /// Load the configuration file (or defaults) and apply the overrides
    /// given on the command line.
    pub fn resolve_config(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::load(path)?,
            None => RunConfig::default(),
        };
        if let Some(count) = self.burst_count {
            config.burst_count = count;
        }
        if let Some(ms) = self.duration_ms {
            config.burst_duration_ms = ms;
        }
        if let Some(ms) = self.ready_timeout_ms {
            config.ready_timeout_ms = ms;
        }
        if let Some(output) = &self.output {
            config.output_dir = output.clone();
        }
        if let Some(rendezvous) = &self.rendezvous {
            config.rendezvous_dir = rendezvous.clone();
        }
        if !self.sensors.is_empty() {
            config.retain_sensors(&self.sensors);
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Args, Clone)]
pub struct ControllerCommand {
    /// The sensor this controller drives
    #[arg(long, value_enum)]
    pub sensor: SensorKind,

    /// Length of one burst, in milliseconds
    #[arg(long = "duration-ms")]
    pub duration_ms: u64,

    /// First burst index this controller may capture
    #[arg(long, default_value_t = 0)]
    pub resume: u64,

    /// Pid of the orchestrator; the controller exits when it is gone
    #[arg(long = "parent-pid")]
    pub parent_pid: Option<u32>,

    /// Set when launched by the orchestrator rather than by hand
    #[arg(long)]
    pub subprocess: bool,

    /// Directory segments are written to
    #[arg(long)]
    pub output: PathBuf,

    /// Directory holding the READY/GO/STOP marker areas
    #[arg(long)]
    pub rendezvous: PathBuf,

    /// RON run configuration shared with the orchestrator
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl ControllerCommand {
    pub fn resolve_config(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::load(path)?,
            None => RunConfig::default(),
        };
        config.burst_duration_ms = self.duration_ms;
        config.output_dir = self.output.clone();
        config.rendezvous_dir = self.rendezvous.clone();
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Args, Clone)]
pub struct InspectCommand {
    /// Chunk file to read; `run.ron` is taken from the same directory
    pub chunk: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_overrides_config() {
        let args = LoggerArgs::parse_from([
            "lightlogger", "run", "-n", "3", "--duration-ms", "250", "--sensors", "world",
            "ambient", "--output", "/tmp/out",
        ]);
        let CommandTask::Run(run) = args.command else {
            panic!("expected run");
        };
        let config = run.resolve_config().unwrap();
        assert_eq!(config.burst_count, 3);
        assert_eq!(config.burst_duration_ms, 250);
        assert_eq!(config.output_dir, PathBuf::from("/tmp/out"));
        let kinds: Vec<_> = config.sensors.iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![SensorKind::World, SensorKind::Ambient]);
    }

    #[test]
    fn controller_invocation() {
        let args = LoggerArgs::parse_from([
            "lightlogger", "controller", "--sensor", "pupil", "--duration-ms", "10000",
            "--resume", "4", "--parent-pid", "1234", "--subprocess", "--output", "readings",
            "--rendezvous", "/tmp/rv",
        ]);
        let CommandTask::Controller(cmd) = args.command else {
            panic!("expected controller");
        };
        assert_eq!(cmd.sensor, SensorKind::Pupil);
        assert_eq!(cmd.resume, 4);
        assert_eq!(cmd.parent_pid, Some(1234));
        assert!(cmd.subprocess);
        assert_eq!(cmd.resolve_config().unwrap().burst_duration_ms, 10_000);
    }

    #[test]
    fn zero_duration_is_rejected() {
        let args = LoggerArgs::parse_from(["lightlogger", "run", "--duration-ms", "0"]);
        let CommandTask::Run(run) = args.command else {
            panic!("expected run");
        };
        assert!(run.resolve_config().is_err());
    }
}
