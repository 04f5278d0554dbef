//! Two ways to start controllers: as child processes of the current binary
//! talking through marker files, or as threads of this process sharing a
//! [`LocalChannel`].

use log::{debug, info, warn};
use std::{
    env, fs,
    path::PathBuf,
    process::{self, Child, Command, Stdio},
    thread::{self, JoinHandle},
};

use super::placement;
use crate::{
    config::{RunConfig, SensorConfig},
    controller::{run_controller, ControllerOptions, ControllerSummary},
    error::Result,
    rendezvous::{LocalChannel, MarkerChannel, RendezvousChannel},
};

/// A running controller as seen by the orchestrator.
pub trait ControllerHandle: Send {
    fn name(&self) -> &str;

    /// `Some(status)` once the controller has ended.
    fn poll_exit(&mut self) -> Option<String>;

    /// Ask the controller to stop now.
    fn terminate(&mut self);

    /// Stop the controller without its cooperation.
    fn kill(&mut self);
}

/// Starts controllers and provides the channel to reach them.
pub trait Launcher {
    type Channel: RendezvousChannel;

    fn channel(&self) -> Result<Self::Channel>;

    /// Start the controller for `sensor`. `slot` is its position in the
    /// launch order and picks a core when none is configured.
    fn launch(
        &mut self,
        sensor: &SensorConfig,
        slot: usize,
        resume_from: u64,
    ) -> Result<Box<dyn ControllerHandle>>;
}

/// Re-executes the current binary with the `controller` subcommand, once
/// per sensor.
pub struct ProcessLauncher {
    exe: PathBuf,
    config: RunConfig,
    config_path: PathBuf,
}

impl ProcessLauncher {
    pub fn new(config: &RunConfig) -> Result<Self> {
        Self::with_binary(env::current_exe()?, config)
    }

    /// Launch controllers from `exe` instead of the running binary. The
    /// effective configuration is saved next to the marker areas so every
    /// controller sees exactly what the orchestrator sees.
    pub fn with_binary(exe: impl Into<PathBuf>, config: &RunConfig) -> Result<Self> {
        fs::create_dir_all(&config.rendezvous_dir)?;
        let config_path = config.rendezvous_dir.join("run_config.ron");
        config.save(&config_path)?;
        Ok(ProcessLauncher {
            exe: exe.into(),
            config: config.clone(),
            config_path,
        })
    }
}

impl Launcher for ProcessLauncher {
    type Channel = MarkerChannel;

    fn channel(&self) -> Result<MarkerChannel> {
        MarkerChannel::open(&self.config.rendezvous_dir, self.config.poll_interval())
    }

    fn launch(
        &mut self,
        sensor: &SensorConfig,
        slot: usize,
        resume_from: u64,
    ) -> Result<Box<dyn ControllerHandle>> {
        let name = sensor.kind.name();
        let child = Command::new(&self.exe)
            .arg("controller")
            .args(["--sensor", name])
            .args(["--duration-ms", &self.config.burst_duration_ms.to_string()])
            .args(["--resume", &resume_from.to_string()])
            .args(["--parent-pid", &process::id().to_string()])
            .arg("--subprocess")
            .arg("--output")
            .arg(&self.config.output_dir)
            .arg("--rendezvous")
            .arg(&self.config.rendezvous_dir)
            .arg("--config")
            .arg(&self.config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()?;

        let pid = child.id();
        info!("{name} : launched controller process {pid}");
        placement::place(name, pid, placement::cpu_for(sensor.cpu, slot), sensor.nice);

        Ok(Box::new(ProcessHandle {
            name: name.to_owned(),
            child,
            status: None,
        }))
    }
}

/// A controller running as a child process.
pub struct ProcessHandle {
    name: String,
    child: Child,
    status: Option<String>,
}

impl ControllerHandle for ProcessHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll_exit(&mut self) -> Option<String> {
        if self.status.is_none() {
            self.status = match self.child.try_wait() {
                Ok(Some(status)) => Some(status.to_string()),
                Ok(None) => None,
                Err(e) => Some(format!("unknown ({e})")),
            };
        }
        self.status.clone()
    }

    fn terminate(&mut self) {
        if self.poll_exit().is_some() {
            return;
        }
        let ret = unsafe { libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM) };
        if ret == -1 {
            warn!(
                "{} : SIGTERM failed : {}",
                self.name,
                std::io::Error::last_os_error()
            );
        }
    }

    fn kill(&mut self) {
        if self.poll_exit().is_some() {
            return;
        }
        if let Err(e) = self.child.kill() {
            warn!("{} : kill failed : {e}", self.name);
        }
        if let Ok(status) = self.child.wait() {
            self.status = Some(status.to_string());
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.poll_exit().is_none() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Runs every controller as a thread of the calling process.
pub struct ThreadLauncher {
    config: RunConfig,
    channel: LocalChannel,
}

impl ThreadLauncher {
    pub fn new(config: &RunConfig) -> Self {
        ThreadLauncher {
            config: config.clone(),
            channel: LocalChannel::new(),
        }
    }
}

impl Launcher for ThreadLauncher {
    type Channel = LocalChannel;

    fn channel(&self) -> Result<LocalChannel> {
        Ok(self.channel.clone())
    }

    fn launch(
        &mut self,
        sensor: &SensorConfig,
        slot: usize,
        resume_from: u64,
    ) -> Result<Box<dyn ControllerHandle>> {
        let name = sensor.kind.name();
        let options = ControllerOptions::from_config(&self.config, sensor.kind, resume_from);
        let config = self.config.clone();
        let channel = self.channel.clone();
        let (cpu, nice) = (placement::cpu_for(sensor.cpu, slot), sensor.nice);

        let handle = thread::Builder::new()
            .name(format!("{name}-controller"))
            .spawn(move || {
                placement::place(name, 0, cpu, nice);
                run_controller(&config, &options, channel)
            })?;
        debug!("{name} : launched controller thread");

        Ok(Box::new(ThreadHandle {
            name: name.to_owned(),
            handle: Some(handle),
            status: None,
        }))
    }
}

/// A controller running as a thread.
pub struct ThreadHandle {
    name: String,
    handle: Option<JoinHandle<Result<ControllerSummary>>>,
    status: Option<String>,
}

impl ControllerHandle for ThreadHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll_exit(&mut self) -> Option<String> {
        if self.status.is_none() && self.handle.as_ref().is_some_and(|h| h.is_finished()) {
            self.status = self.handle.take().map(|h| match h.join() {
                Ok(Ok(summary)) => format!("finished after {} bursts", summary.bursts.len()),
                Ok(Err(e)) => format!("failed: {e}"),
                Err(_) => "panicked".to_owned(),
            });
        }
        self.status.clone()
    }

    fn terminate(&mut self) {
        debug!("{} : threads stop at the next burst boundary", self.name);
    }

    fn kill(&mut self) {
        if self.poll_exit().is_none() && self.handle.take().is_some() {
            warn!("{} : controller thread left running", self.name);
            self.status = Some("detached".to_owned());
        }
    }
}
