//! Entry point for every role of the logger. `run` is what an operator
//! starts; it re-executes this binary with `controller` once per sensor.

use clap::Parser;
use lightlogger::{
    args::{CommandTask, ControllerCommand, InspectCommand, LoggerArgs, RunCommand},
    chunk::{parse, RunMetadata, SensorData},
    controller::{run_controller, ControllerOptions},
    error::Result,
    orchestrator::{Orchestrator, ProcessLauncher, RunReport, ThreadLauncher},
    rendezvous::MarkerChannel,
    sensor::SensorKind,
};
use log::{error, info};
use std::{path::Path, process::ExitCode};

// Example:
// cargo run -- run --bursts 6 --duration-ms 10000 --output readings
// cargo run -- inspect readings/chunk_0

fn main() -> ExitCode {
    env_logger::init();
    let args = LoggerArgs::parse();

    let outcome = match args.command {
        CommandTask::Run(cmd) => run(&cmd),
        CommandTask::Controller(cmd) => controller(&cmd).map(|()| ExitCode::SUCCESS),
        CommandTask::Inspect(cmd) => inspect(&cmd).map(|()| ExitCode::SUCCESS),
    };
    outcome.unwrap_or_else(|e| {
        error!("{e}");
        ExitCode::FAILURE
    })
}

fn run(cmd: &RunCommand) -> Result<ExitCode> {
    let config = cmd.resolve_config()?;
    let report = if cmd.threads {
        Orchestrator::new(config.clone(), ThreadLauncher::new(&config))?.run(cmd.resume)?
    } else {
        Orchestrator::new(config.clone(), ProcessLauncher::new(&config)?)?.run(cmd.resume)?
    };

    match report {
        RunReport::Completed { chunks, next_burst } => {
            info!("{} chunks written, next burst {next_burst}", chunks.len());
            Ok(ExitCode::SUCCESS)
        }
        RunReport::Aborted {
            cause,
            resume_from,
            chunks,
        } => {
            error!(
                "aborted after {} chunks : {cause}; continue with --resume {resume_from}",
                chunks.len()
            );
            Ok(ExitCode::from(2))
        }
    }
}

fn controller(cmd: &ControllerCommand) -> Result<()> {
    let config = cmd.resolve_config()?;
    let mut options = ControllerOptions::from_config(&config, cmd.sensor, cmd.resume);
    // only watch the parent when it is the orchestrator
    if cmd.subprocess {
        options.parent_pid = cmd.parent_pid;
    }
    let channel = MarkerChannel::open(&cmd.rendezvous, config.poll_interval())?;
    run_controller(&config, &options, channel)?;
    Ok(())
}

fn inspect(cmd: &InspectCommand) -> Result<()> {
    let run_dir = cmd.chunk.parent().unwrap_or(Path::new("."));
    let metadata = RunMetadata::from_path(run_dir)?;
    let chunk = parse(&cmd.chunk, &metadata)?;

    println!("{:?}: burst {}", cmd.chunk, chunk.burst_index);
    for kind in SensorKind::ALL {
        match chunk.sensor(kind) {
            SensorData::Present(reading) => {
                println!(
                    "  {kind:<9} {:>6} samples at {:>8.2} Hz, shape {:?}",
                    reading.sample_count, reading.observed_rate, reading.layout.shape
                );
                for field in &reading.layout.fields {
                    println!("    {:<12} {:?} {:?}", field.name, field.element, field.shape);
                }
            }
            SensorData::Absent => println!("  {kind:<9} absent"),
            SensorData::OpenFailed => println!("  {kind:<9} open failed"),
        }
    }
    Ok(())
}
