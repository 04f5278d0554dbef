//! The READY / GO / STOP handshake that keeps independently scheduled
//! controllers in lock-step.
//!
//! The orchestrator is the [`Leader`], each controller a [`Follower`]. They
//! only talk through a [`RendezvousChannel`]:
//!
//! 1. every follower posts READY once its device and buffers are set up,
//! 2. the leader waits for all of them, clears the READY area, then posts
//!    one GO per follower carrying the burst index,
//! 3. each follower consumes its GO, captures one burst and posts READY
//!    again, naming the burst it just completed,
//! 4. after the last burst the leader posts STOP instead of GO.
//!
//! Markers are always removed by whoever consumes them: READY and STOP by
//! the leader, GO by the follower it was addressed to.

mod local;
mod marker;

pub use local::LocalChannel;
pub use marker::MarkerChannel;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::error::{LoggerError, Result};

/// What a follower can be told at a burst boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Go(u64),
    Stop,
}

/// Where a follower is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
    Initializing,
    Ready,
    Recording,
    Finished,
    Error,
}

/// The content of a READY marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyMarker {
    pub controller: String,
    /// The burst just finished, or `None` right after initialization.
    pub completed_burst: Option<u64>,
    pub pid: u32,
}

/// Transport for rendezvous markers. Implementations must make a posted
/// marker visible atomically: a reader sees all of it or none of it.
pub trait RendezvousChannel: Send + Sync {
    fn post_ready(&self, marker: &ReadyMarker) -> Result<()>;

    /// Every READY marker currently posted.
    fn ready_markers(&self) -> Result<Vec<ReadyMarker>>;

    fn clear_ready(&self) -> Result<()>;

    fn post_go(&self, controller: &str, burst_index: u64) -> Result<()>;

    /// Consume the GO addressed to `controller` if there is one, otherwise
    /// report STOP if it has been posted. STOP is left in place.
    fn take_signal(&self, controller: &str) -> Result<Option<Signal>>;

    fn post_stop(&self) -> Result<()>;

    /// Remove every marker in the area.
    fn reset(&self) -> Result<()>;

    /// Block until something may have changed, for at most `timeout`.
    fn wait_for_change(&self, timeout: Duration) -> Result<()>;
}

/// Whether a process with this pid still exists.
pub fn pid_alive(pid: u32) -> bool {
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// The orchestrator's side of the handshake.
pub struct Leader<C> {
    channel: C,
    controllers: Vec<String>,
    poll: Duration,
}

impl<C: RendezvousChannel> Leader<C> {
    pub fn new(channel: C, controllers: Vec<String>, poll: Duration) -> Self {
        Leader {
            channel,
            controllers,
            poll,
        }
    }

    pub fn controllers(&self) -> &[String] {
        &self.controllers
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Wait until every controller has posted READY having completed
    /// `expected` (`None` for the initial READY). `check` runs between
    /// polls and aborts the wait by returning an error, e.g. when a
    /// controller process died.
    pub fn await_all_ready(
        &self,
        expected: Option<u64>,
        timeout: Duration,
        mut check: impl FnMut() -> Result<()>,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let markers = self.channel.ready_markers()?;
            let missing = self.missing_from(&markers, expected);
            if missing.is_empty() {
                debug!("all {} controllers ready after {expected:?}", self.controllers.len());
                return Ok(());
            }

            check()?;

            let now = Instant::now();
            if now >= deadline {
                for marker in markers.iter().filter(|m| m.completed_burst != expected) {
                    warn!(
                        "{} : READY names burst {:?}, expected {expected:?}",
                        marker.controller, marker.completed_burst
                    );
                }
                return Err(LoggerError::InitializationTimeout { missing });
            }
            self.channel.wait_for_change(self.poll.min(deadline - now))?;
        }
    }

    /// Controllers that have not yet posted READY for `expected`.
    pub fn missing(&self, expected: Option<u64>) -> Result<Vec<String>> {
        Ok(self.missing_from(&self.channel.ready_markers()?, expected))
    }

    fn missing_from(&self, markers: &[ReadyMarker], expected: Option<u64>) -> Vec<String> {
        self.controllers
            .iter()
            .filter(|name| {
                !markers
                    .iter()
                    .any(|m| &m.controller == *name && m.completed_burst == expected)
            })
            .cloned()
            .collect()
    }

    /// Clear the READY area, then release every controller into
    /// `burst_index`.
    pub fn broadcast_go(&self, burst_index: u64) -> Result<()> {
        self.channel.clear_ready()?;
        for name in &self.controllers {
            self.channel.post_go(name, burst_index)?;
        }
        info!("GO burst {burst_index}");
        Ok(())
    }

    pub fn broadcast_stop(&self) -> Result<()> {
        self.channel.clear_ready()?;
        self.channel.post_stop()?;
        info!("STOP");
        Ok(())
    }

    /// Remove every marker, STOP included. Called once the run is over.
    pub fn finish(&self) -> Result<()> {
        self.channel.reset()
    }
}

/// A controller's side of the handshake.
pub struct Follower<C> {
    channel: C,
    name: String,
    parent: Option<u32>,
    poll: Duration,
    state: ReadinessState,
    last_completed: Option<u64>,
}

impl<C: RendezvousChannel> Follower<C> {
    /// `parent` is the pid to watch while blocked; `None` skips the check.
    pub fn new(channel: C, name: impl Into<String>, parent: Option<u32>, poll: Duration) -> Self {
        Follower {
            channel,
            name: name.into(),
            parent,
            poll,
            state: ReadinessState::Initializing,
            last_completed: None,
        }
    }

    pub fn state(&self) -> ReadinessState {
        self.state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bursts up to and including this one will not be captured again.
    pub fn resume_after(&mut self, burst_index: Option<u64>) {
        self.last_completed = burst_index;
    }

    pub fn fail(&mut self) {
        self.state = ReadinessState::Error;
    }

    pub fn announce_ready(&mut self, completed: Option<u64>) -> Result<()> {
        if let Some(burst) = completed {
            self.last_completed = Some(burst);
        }
        self.channel.post_ready(&ReadyMarker {
            controller: self.name.clone(),
            completed_burst: completed,
            pid: std::process::id(),
        })?;
        self.state = ReadinessState::Ready;
        debug!("{} : READY after {completed:?}", self.name);
        Ok(())
    }

    /// Block at the burst boundary until GO or STOP. A GO for a burst this
    /// follower already captured is logged and dropped. If the parent
    /// process is gone the follower behaves as if STOP had been posted.
    pub fn await_signal(&mut self) -> Result<Signal> {
        if self.state != ReadinessState::Ready {
            let violation = LoggerError::RendezvousViolation(format!(
                "{} waited for a signal while {:?}",
                self.name, self.state
            ));
            warn!("{violation}");
            return Err(violation);
        }
        loop {
            match self.channel.take_signal(&self.name)? {
                Some(Signal::Go(burst)) if self.last_completed.is_some_and(|done| burst <= done) => {
                    warn!(
                        "{}",
                        LoggerError::RendezvousViolation(format!(
                            "{} got GO for burst {burst}, already captured",
                            self.name
                        ))
                    );
                }
                Some(Signal::Go(burst)) => {
                    self.state = ReadinessState::Recording;
                    return Ok(Signal::Go(burst));
                }
                Some(Signal::Stop) => {
                    self.state = ReadinessState::Finished;
                    return Ok(Signal::Stop);
                }
                None => {}
            }
            if let Some(parent) = self.parent.filter(|&pid| !pid_alive(pid)) {
                warn!("{} : parent {parent} is gone, stopping", self.name);
                self.state = ReadinessState::Finished;
                return Ok(Signal::Stop);
            }
            self.channel.wait_for_change(self.poll)?;
        }
    }
}
