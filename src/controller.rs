//! One sensor's controller: opens the device, then captures one burst per
//! GO until STOP, handing every filled buffer to a writer thread so the
//! capture thread never touches the disk. READY for a burst is only posted
//! once its segment is on disk.

use log::{debug, error, info, warn};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc::{self, TrySendError},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::{
    capture::CaptureLoop,
    chunk::{ChunkWriter, RunMetadata},
    component::{run_component, CapturedBurst, SegmentWriter, WrittenBurst},
    config::RunConfig,
    device::open_device,
    error::{LoggerError, Result},
    rendezvous::{Follower, RendezvousChannel, Signal},
    ring_buffer::RingBuffer,
    sensor::SensorKind,
};

/// How one controller was asked to run.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerOptions {
    pub sensor: SensorKind,
    pub burst_duration: Duration,
    /// First burst index this controller may capture.
    pub resume_from: u64,
    /// Process to watch while blocked; the controller stops when it exits.
    pub parent_pid: Option<u32>,
    pub output_dir: PathBuf,
}

impl ControllerOptions {
    pub fn from_config(config: &RunConfig, sensor: SensorKind, resume_from: u64) -> Self {
        ControllerOptions {
            sensor,
            burst_duration: config.burst_duration(),
            resume_from,
            parent_pid: None,
            output_dir: config.output_dir.clone(),
        }
    }
}

/// What a controller did before it exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSummary {
    pub sensor: SensorKind,
    pub bursts: Vec<u64>,
}

/// Run a controller to completion over `channel`.
///
/// Errors before the first READY (device or config problems) mean the
/// orchestrator never hears from this controller and times out. Errors
/// after it, a failed segment write included, end the controller without
/// READY for the burst in progress.
pub fn run_controller<C: RendezvousChannel>(
    config: &RunConfig,
    options: &ControllerOptions,
    channel: C,
) -> Result<ControllerSummary> {
    let kind = options.sensor;
    let mut follower = Follower::new(channel, kind.name(), options.parent_pid, config.poll_interval());
    follower.resume_after(options.resume_from.checked_sub(1));

    let sensor = config
        .sensor(kind)
        .ok_or_else(|| LoggerError::Config(format!("{kind} is not configured")))?;
    let device = open_device(sensor).map_err(|e| {
        follower.fail();
        e
    })?;
    let mut capture = CaptureLoop::new(device, sensor, config);
    capture.prime()?;

    let capacity = sensor.capacity(options.burst_duration);
    let sample_bytes = sensor.layout().bytes_per_sample;
    let mut free = Some(RingBuffer::new(capacity, sample_bytes));
    debug!(
        "{kind} : buffer of {capacity} x {sample_bytes} bytes at {:.1} Hz",
        sensor.rate_hz()
    );

    let metadata = RunMetadata::from_config(config);
    let depth = Arc::new(AtomicUsize::new(0));
    let (burst_tx, burst_rx) = mpsc::sync_channel::<CapturedBurst>(1);
    let (recycle_tx, recycle_rx) = mpsc::channel::<WrittenBurst>();
    let writer = SegmentWriter::new(
        kind,
        ChunkWriter::new(&options.output_dir, &metadata),
        depth.clone(),
    );
    let writer_handle = run_component(Box::new(writer), burst_rx, recycle_tx);

    let mut summary = ControllerSummary {
        sensor: kind,
        bursts: Vec::new(),
    };
    let outcome = (|| -> Result<()> {
        follower.announce_ready(None)?;
        loop {
            let burst_index = match follower.await_signal()? {
                Signal::Go(burst_index) => burst_index,
                Signal::Stop => return Ok(()),
            };
            let mut buffer = free
                .take()
                .ok_or_else(|| LoggerError::Channel(format!("{kind} buffer was not returned")))?;
            let report = capture.run(&mut buffer, options.burst_duration)?;
            info!(
                "{kind} : burst {burst_index} done, {} samples at {:.2} Hz",
                report.sample_count, report.observed_rate
            );

            let queued = depth.fetch_add(1, Ordering::SeqCst) + 1;
            let captured = CapturedBurst {
                burst_index,
                report,
                buffer,
            };
            match burst_tx.try_send(captured) {
                Ok(()) => {}
                Err(TrySendError::Full(captured)) => {
                    warn!("{}", LoggerError::QueueBackpressure { sensor: kind, depth: queued });
                    burst_tx.send(captured)?;
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(LoggerError::Channel(format!("{kind} writer is gone")));
                }
            }
            debug!("{kind} : write queue depth {queued}");

            let handed_over = Instant::now();
            let written = recycle_rx.recv()?;
            if handed_over.elapsed() > options.burst_duration {
                let depth = depth.load(Ordering::SeqCst);
                warn!("{}", LoggerError::QueueBackpressure { sensor: kind, depth });
            }
            free = Some(written.buffer);
            written.outcome?;

            summary.bursts.push(burst_index);
            follower.announce_ready(Some(burst_index))?;
        }
    })();

    // let the writer drain whatever is queued before reporting
    drop(burst_tx);
    if writer_handle.join().is_err() {
        error!("{kind} : writer thread panicked");
    }
    if let Err(e) = capture.close() {
        warn!("{kind} : close failed : {e}");
    }

    match outcome {
        Ok(()) => {
            info!("{kind} : finished after {} bursts", summary.bursts.len());
            Ok(summary)
        }
        Err(e) => {
            follower.fail();
            error!("{kind} : {e}");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chunk::{parse, segment_path},
        config::{DriverConfig, SensorConfig},
        rendezvous::{Leader, LocalChannel},
    };
    use std::thread;

    fn config(dir: &std::path::Path, kinds: &[SensorKind]) -> RunConfig {
        let mut config = RunConfig {
            burst_duration_ms: 40,
            poll_interval_ms: 1,
            output_dir: dir.to_owned(),
            ..RunConfig::default()
        };
        config.retain_sensors(kinds);
        config
    }

    #[test]
    fn captures_one_segment_per_go() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), &[SensorKind::Ambient]);
        config.sensors[0].rate_hz = Some(100.0);

        let channel = LocalChannel::new();
        let leader = Leader::new(channel.clone(), vec!["ambient".to_owned()], Duration::from_millis(1));
        let options = ControllerOptions::from_config(&config, SensorKind::Ambient, 0);
        let worker_config = config.clone();
        let handle = thread::spawn(move || run_controller(&worker_config, &options, channel));

        let timeout = Duration::from_secs(5);
        leader.await_all_ready(None, timeout, || Ok(())).unwrap();
        for burst in 0..3 {
            leader.broadcast_go(burst).unwrap();
            leader.await_all_ready(Some(burst), timeout, || Ok(())).unwrap();
        }
        leader.broadcast_stop().unwrap();
        let summary = handle.join().unwrap().unwrap();
        assert_eq!(summary.bursts, vec![0, 1, 2]);

        let meta = RunMetadata::from_config(&config);
        for burst in 0..3 {
            let parsed = parse(segment_path(dir.path(), burst, SensorKind::Ambient), &meta).unwrap();
            let reading = parsed.reading(SensorKind::Ambient).unwrap();
            assert!(reading.sample_count > 0);
            assert!(reading.sample_count as usize <= config.sensors[0].capacity(config.burst_duration()));
        }
    }

    #[test]
    fn resumed_controller_ignores_old_bursts() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), &[SensorKind::Spectral]);
        let channel = LocalChannel::new();
        let leader = Leader::new(channel.clone(), vec!["spectral".to_owned()], Duration::from_millis(1));
        let options = ControllerOptions::from_config(&config, SensorKind::Spectral, 5);
        let worker_config = config.clone();
        let handle = thread::spawn(move || run_controller(&worker_config, &options, channel));

        let timeout = Duration::from_secs(5);
        leader.await_all_ready(None, timeout, || Ok(())).unwrap();
        // burst 4 belongs to an earlier attempt and must not be captured
        leader.broadcast_go(4).unwrap();
        assert!(leader
            .await_all_ready(Some(4), Duration::from_millis(50), || Ok(()))
            .is_err());
        leader.broadcast_stop().unwrap();
        assert!(handle.join().unwrap().unwrap().bursts.is_empty());
    }

    #[test]
    fn failed_write_withholds_ready() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), &[SensorKind::Ambient]);
        config.sensors[0].rate_hz = Some(100.0);
        config.output_dir = dir.path().join("not-created");

        let channel = LocalChannel::new();
        let leader = Leader::new(channel.clone(), vec!["ambient".to_owned()], Duration::from_millis(1));
        let options = ControllerOptions::from_config(&config, SensorKind::Ambient, 0);
        let worker_config = config.clone();
        let worker_channel = channel.clone();
        let handle = thread::spawn(move || run_controller(&worker_config, &options, worker_channel));

        leader
            .await_all_ready(None, Duration::from_secs(5), || Ok(()))
            .unwrap();
        leader.broadcast_go(0).unwrap();
        let result = handle.join().unwrap();
        assert!(matches!(result, Err(LoggerError::Io(_))), "{result:?}");
        assert!(channel.ready_markers().unwrap().is_empty());
        assert!(leader
            .await_all_ready(Some(0), Duration::from_millis(20), || Ok(()))
            .is_err());
    }

    #[test]
    fn device_that_never_opens_never_reports_ready() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path(), &[SensorKind::Spectral]);
        config.sensors[0] = SensorConfig {
            driver: DriverConfig::Serial {
                path: "/nonexistent/ttyACM7".into(),
                baud_rate: 115_200,
            },
            ..SensorConfig::simulated(SensorKind::Spectral)
        };
        let channel = LocalChannel::new();
        let options = ControllerOptions::from_config(&config, SensorKind::Spectral, 0);

        let result = run_controller(&config, &options, channel.clone());
        assert!(matches!(result, Err(LoggerError::DeviceError { .. })));
        assert!(channel.ready_markers().unwrap().is_empty());
    }

    #[test]
    fn unconfigured_sensor_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), &[SensorKind::Ambient]);
        let options = ControllerOptions::from_config(&config, SensorKind::World, 0);
        assert!(matches!(
            run_controller(&config, &options, LocalChannel::new()),
            Err(LoggerError::Config(_))
        ));
    }
}
