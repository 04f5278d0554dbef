//! The master side of a run: launch one controller per sensor, drive them
//! through the bursts in lock-step, then tear down and merge the segments
//! each burst left behind into `chunk_<N>` files.
//!
//! ```text
//! Launching -> AwaitingReady -> (SignalGo -> AwaitingReady)* -> Draining -> Done
//! ```
//!
//! Any failure moves the orchestrator to `Error`, after which it still
//! stops and reaps every controller and assembles the bursts that did
//! complete.

mod launcher;
mod placement;

pub use launcher::{
    ControllerHandle, Launcher, ProcessHandle, ProcessLauncher, ThreadHandle, ThreadLauncher,
};
pub use placement::{cpu_for, place};

use log::{debug, error, info, warn};
use std::{
    path::PathBuf,
    time::{Duration, Instant},
};

use crate::{
    chunk::{assemble_burst, discard_segments, next_burst_index, RunMetadata},
    config::RunConfig,
    error::{LoggerError, Result},
    rendezvous::Leader,
};

/// How long terminated controllers get before they are killed outright.
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Launching,
    AwaitingReady,
    SignalGo,
    Draining,
    Done,
    Error,
}

/// How a run ended.
#[derive(Debug)]
pub enum RunReport {
    Completed {
        chunks: Vec<PathBuf>,
        /// Index the next run in the same directory starts at.
        next_burst: u64,
    },
    Aborted {
        cause: LoggerError,
        /// First burst that was not captured by every controller.
        resume_from: u64,
        chunks: Vec<PathBuf>,
    },
}

impl RunReport {
    pub fn chunks(&self) -> &[PathBuf] {
        match self {
            RunReport::Completed { chunks, .. } | RunReport::Aborted { chunks, .. } => chunks,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RunReport::Completed { .. })
    }
}

pub struct Orchestrator<L: Launcher> {
    config: RunConfig,
    launcher: L,
    leader: Leader<L::Channel>,
    metadata: RunMetadata,
    handles: Vec<Box<dyn ControllerHandle>>,
    state: OrchestratorState,
    next_burst: u64,
    completed: Vec<u64>,
}

impl<L: Launcher> Orchestrator<L> {
    pub fn new(config: RunConfig, launcher: L) -> Result<Self> {
        let controllers = config
            .sensors
            .iter()
            .map(|s| s.kind.name().to_owned())
            .collect();
        let leader = Leader::new(launcher.channel()?, controllers, config.poll_interval());
        let metadata = RunMetadata::from_config(&config);
        Ok(Orchestrator {
            config,
            launcher,
            leader,
            metadata,
            handles: Vec::new(),
            state: OrchestratorState::Launching,
            next_burst: 0,
            completed: Vec::new(),
        })
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    fn transition(&mut self, next: OrchestratorState) {
        debug!("orchestrator : {:?} -> {next:?}", self.state);
        self.state = next;
    }

    /// Capture `burst_count` bursts starting at `resume`, or right after the
    /// last chunk already in the output directory when `None`.
    ///
    /// Only setup problems (unreadable output directory, mismatched run
    /// metadata, a `resume` that would overwrite existing chunks) are
    /// returned as `Err`. Anything that goes wrong once
    /// controllers exist ends in [`RunReport::Aborted`].
    pub fn run(mut self, resume: Option<u64>) -> Result<RunReport> {
        let output = self.config.output_dir.clone();
        self.metadata.establish(&output)?;
        let first_free = next_burst_index(&output)?;
        self.next_burst = match resume {
            Some(index) if index < first_free => {
                return Err(LoggerError::Config(format!(
                    "cannot resume at burst {index}: {output:?} already holds chunks up to {}",
                    first_free - 1
                )));
            }
            Some(index) => index,
            None => first_free,
        };
        let stale = discard_segments(&output)?;
        if stale > 0 {
            warn!("discarded {stale} segments from an interrupted run");
        }
        self.leader.finish()?;
        info!(
            "run of {} bursts from burst {} with {:?}",
            self.config.burst_count,
            self.next_burst,
            self.leader.controllers()
        );

        let outcome = self.capture();
        match outcome {
            Ok(()) => {
                self.transition(OrchestratorState::Draining);
                self.drain();
                let chunks = self.assemble()?;
                self.leader.finish()?;
                self.transition(OrchestratorState::Done);
                info!("run complete, {} chunks", chunks.len());
                Ok(RunReport::Completed {
                    chunks,
                    next_burst: self.next_burst,
                })
            }
            Err(cause) => {
                self.transition(OrchestratorState::Error);
                error!("run aborted at burst {} : {cause}", self.next_burst);
                self.drain();
                let chunks = self.assemble()?;
                discard_segments(&output)?;
                self.leader.finish()?;
                Ok(RunReport::Aborted {
                    cause,
                    resume_from: self.next_burst,
                    chunks,
                })
            }
        }
    }

    fn capture(&mut self) -> Result<()> {
        self.launch()?;
        self.transition(OrchestratorState::AwaitingReady);
        let timeout = self.config.ready_timeout();
        let leader = &self.leader;
        let handles = &mut self.handles;
        leader.await_all_ready(None, timeout, || {
            // a controller that dies before READY never became ready
            check_controllers(handles).map_err(|exited| {
                warn!("{exited}");
                match leader.missing(None) {
                    Ok(missing) => LoggerError::InitializationTimeout { missing },
                    Err(e) => e,
                }
            })
        })?;
        self.run_bursts(self.config.burst_count)
    }

    /// Start a controller for every configured sensor.
    pub fn launch(&mut self) -> Result<()> {
        self.transition(OrchestratorState::Launching);
        let sensors = self.config.sensors.clone();
        for (slot, sensor) in sensors.iter().enumerate() {
            let handle = self.launcher.launch(sensor, slot, self.next_burst)?;
            self.handles.push(handle);
        }
        Ok(())
    }

    /// Release `count` bursts one after the other, waiting for every
    /// controller to finish each one before starting the next.
    pub fn run_bursts(&mut self, count: u64) -> Result<()> {
        let timeout = self.config.burst_duration() + self.config.ready_timeout();
        for _ in 0..count {
            let burst = self.next_burst;
            self.transition(OrchestratorState::SignalGo);
            self.leader.broadcast_go(burst)?;
            self.transition(OrchestratorState::AwaitingReady);
            let handles = &mut self.handles;
            self.leader
                .await_all_ready(Some(burst), timeout, || check_controllers(handles))?;
            self.completed.push(burst);
            self.next_burst = burst + 1;
            info!("burst {burst} complete");
        }
        Ok(())
    }

    /// Post STOP and wait for every controller to exit, escalating to
    /// SIGTERM and then to a kill for those that do not.
    fn drain(&mut self) {
        if let Err(e) = self.leader.broadcast_stop() {
            warn!("could not post STOP : {e}");
        }
        let grace = self.config.stop_grace() + self.config.burst_duration();
        if self.await_exit(grace) {
            return;
        }
        for handle in self.handles.iter_mut() {
            if handle.poll_exit().is_none() {
                warn!("{} : did not stop, terminating", handle.name());
                handle.terminate();
            }
        }
        if self.await_exit(TERMINATE_GRACE) {
            return;
        }
        for handle in self.handles.iter_mut() {
            if handle.poll_exit().is_none() {
                warn!("{} : killing", handle.name());
                handle.kill();
            }
        }
    }

    /// Poll the controllers until all have exited or `timeout` passes.
    fn await_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let mut running = 0;
            for handle in self.handles.iter_mut() {
                if handle.poll_exit().is_none() {
                    running += 1;
                }
            }
            if running == 0 {
                for handle in self.handles.iter_mut() {
                    let status = handle.poll_exit().unwrap_or_default();
                    debug!("{} : {status}", handle.name());
                }
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            spin_sleep::sleep(self.config.poll_interval());
        }
    }

    fn assemble(&self) -> Result<Vec<PathBuf>> {
        self.completed
            .iter()
            .map(|&burst| assemble_burst(&self.config.output_dir, burst, &self.metadata))
            .collect()
    }
}

/// Fail if any controller has exited while it was still expected to post
/// READY.
fn check_controllers(handles: &mut [Box<dyn ControllerHandle>]) -> Result<()> {
    for handle in handles.iter_mut() {
        if let Some(status) = handle.poll_exit() {
            return Err(LoggerError::ControllerExited {
                controller: handle.name().to_owned(),
                status,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chunk::{parse, SensorData},
        config::{DriverConfig, FrameGeometry, SensorConfig},
        rendezvous::{Follower, Signal},
        sensor::SensorKind,
    };
    use std::path::Path;

    fn config(dir: &Path) -> RunConfig {
        let mut config = RunConfig {
            burst_duration_ms: 50,
            burst_count: 2,
            ready_timeout_ms: 2_000,
            stop_grace_ms: 500,
            poll_interval_ms: 1,
            output_dir: dir.join("readings"),
            ..RunConfig::default()
        };
        config.retain_sensors(&[SensorKind::World, SensorKind::Ambient, SensorKind::Spectral]);
        for sensor in config.sensors.iter_mut() {
            sensor.rate_hz = Some(100.0);
        }
        sensor(&mut config, SensorKind::World).frame = Some(FrameGeometry {
            rows: 48,
            cols: 64,
            downsample: 4,
        });
        config
    }

    fn sensor(config: &mut RunConfig, kind: SensorKind) -> &mut SensorConfig {
        config.sensors.iter_mut().find(|s| s.kind == kind).unwrap()
    }

    fn run(config: &RunConfig, resume: Option<u64>) -> RunReport {
        let orchestrator = Orchestrator::new(config.clone(), ThreadLauncher::new(config)).unwrap();
        orchestrator.run(resume).unwrap()
    }

    #[test]
    fn bursts_become_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        let report = run(&config, None);
        let RunReport::Completed { chunks, next_burst } = &report else {
            panic!("unexpected {report:?}");
        };
        assert_eq!(chunks.len(), 2);
        assert_eq!(*next_burst, 2);

        let meta = RunMetadata::from_path(&config.output_dir).unwrap();
        for (burst, chunk) in chunks.iter().enumerate() {
            let parsed = parse(chunk, &meta).unwrap();
            assert_eq!(parsed.burst_index, burst as u64);
            for kind in [SensorKind::World, SensorKind::Ambient, SensorKind::Spectral] {
                assert!(parsed.reading(kind).is_some_and(|r| r.sample_count > 0));
            }
            assert!(matches!(parsed.sensor(SensorKind::Pupil), SensorData::Absent));
        }
        // segments are merged away
        assert_eq!(discard_segments(&config.output_dir).unwrap(), 0);
    }

    #[test]
    fn second_run_continues_numbering() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.burst_count = 1;

        run(&config, None);
        let report = run(&config, None);
        assert_eq!(report.chunks(), [crate::chunk::chunk_path(&config.output_dir, 1)]);
        assert_eq!(next_burst_index(&config.output_dir).unwrap(), 2);
    }

    #[test]
    fn resume_cannot_overwrite_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.burst_count = 1;
        run(&config, None);
        let chunk = crate::chunk::chunk_path(&config.output_dir, 0);
        let before = std::fs::read(&chunk).unwrap();

        let orchestrator = Orchestrator::new(config.clone(), ThreadLauncher::new(&config)).unwrap();
        assert!(matches!(orchestrator.run(Some(0)), Err(LoggerError::Config(_))));
        assert_eq!(std::fs::read(&chunk).unwrap(), before);

        // skipping ahead is allowed
        let report = run(&config, Some(4));
        assert_eq!(report.chunks(), [crate::chunk::chunk_path(&config.output_dir, 4)]);
    }

    /// Runs the real controllers, except that spectral answers only the
    /// first `bursts` GOs and disappears on the next one.
    struct DyingLauncher {
        inner: ThreadLauncher,
        bursts: u64,
    }

    struct DyingHandle(Option<std::thread::JoinHandle<()>>);

    impl ControllerHandle for DyingHandle {
        fn name(&self) -> &str {
            "spectral"
        }

        fn poll_exit(&mut self) -> Option<String> {
            if self.0.as_ref().is_some_and(|h| !h.is_finished()) {
                return None;
            }
            if let Some(handle) = self.0.take() {
                handle.join().unwrap();
            }
            Some("gone".to_owned())
        }

        fn terminate(&mut self) {}

        fn kill(&mut self) {}
    }

    impl Launcher for DyingLauncher {
        type Channel = crate::rendezvous::LocalChannel;

        fn channel(&self) -> Result<Self::Channel> {
            self.inner.channel()
        }

        fn launch(
            &mut self,
            sensor: &SensorConfig,
            slot: usize,
            resume_from: u64,
        ) -> Result<Box<dyn ControllerHandle>> {
            if sensor.kind != SensorKind::Spectral {
                return self.inner.launch(sensor, slot, resume_from);
            }
            let channel = self.inner.channel()?;
            let bursts = self.bursts;
            let handle = std::thread::spawn(move || {
                let mut follower =
                    Follower::new(channel, "spectral", None, Duration::from_millis(1));
                follower.announce_ready(None).unwrap();
                for _ in 0..bursts {
                    match follower.await_signal().unwrap() {
                        Signal::Go(burst) => follower.announce_ready(Some(burst)).unwrap(),
                        Signal::Stop => return,
                    }
                }
                // vanish in the middle of the next burst
                follower.await_signal().unwrap();
            });
            Ok(Box::new(DyingHandle(Some(handle))))
        }
    }

    #[test]
    fn aborted_run_resumes_where_it_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.burst_count = 3;

        let launcher = DyingLauncher {
            inner: ThreadLauncher::new(&config),
            bursts: 1,
        };
        let report = Orchestrator::new(config.clone(), launcher)
            .unwrap()
            .run(None)
            .unwrap();
        let RunReport::Aborted {
            cause,
            resume_from,
            chunks,
        } = report
        else {
            panic!("unexpected {report:?}");
        };
        assert!(matches!(cause, LoggerError::ControllerExited { .. }), "{cause:?}");
        assert_eq!(resume_from, 1);
        assert_eq!(chunks, [crate::chunk::chunk_path(&config.output_dir, 0)]);
        let first = std::fs::read(&chunks[0]).unwrap();

        config.burst_count = 2;
        let report = run(&config, Some(resume_from));
        assert!(report.is_completed());
        assert_eq!(
            report.chunks(),
            [
                crate::chunk::chunk_path(&config.output_dir, 1),
                crate::chunk::chunk_path(&config.output_dir, 2)
            ]
        );
        assert_eq!(std::fs::read(&chunks[0]).unwrap(), first);
        assert_eq!(next_burst_index(&config.output_dir).unwrap(), 3);
    }

    #[test]
    fn unopenable_device_times_out_without_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.ready_timeout_ms = 200;
        sensor(&mut config, SensorKind::Spectral).driver = DriverConfig::Serial {
            path: "/nonexistent/ttyACM7".into(),
            baud_rate: 115_200,
        };

        let report = run(&config, Some(3));
        match report {
            RunReport::Aborted {
                cause,
                resume_from,
                chunks,
            } => {
                assert!(chunks.is_empty());
                assert_eq!(resume_from, 3);
                match cause {
                    LoggerError::InitializationTimeout { missing } => {
                        assert!(missing.contains(&"spectral".to_owned()), "{missing:?}")
                    }
                    other => panic!("unexpected cause {other:?}"),
                }
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(next_burst_index(&config.output_dir).unwrap(), 0);
    }

    #[test]
    fn mismatched_metadata_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let mut other = config.clone();
        other.sensors.push(SensorConfig::simulated(SensorKind::Pupil));
        RunMetadata::from_config(&other)
            .establish(&config.output_dir)
            .unwrap();

        let orchestrator = Orchestrator::new(config.clone(), ThreadLauncher::new(&config)).unwrap();
        assert!(matches!(orchestrator.run(None), Err(LoggerError::Config(_))));
    }
}
