//! Defines the Component trait for stages that run on their own thread and
//! are fed over a channel, and the segment writer stage that sits behind
//! every capture loop.

use log::{debug, error, info, warn};
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc::{Receiver, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
};

use crate::{
    capture::CaptureReport,
    chunk::{ChunkWriter, SensorPayload},
    error::Result,
    ring_buffer::RingBuffer,
    sensor::SensorKind,
};

///
/// A stage that consumes values from one channel and produces values on
/// another, on its own thread.
///
pub trait Component: ToString {
    type InData;
    type OutData;

    /// Converts an input of type A into an output of type B
    fn convert(&mut self, input: Self::InData) -> Self::OutData;

    /// Cleans up at termination of pipeline
    fn finalize(&mut self) -> Result<()>;
}

/// Runs the given Component on its own thread. On receiving data of type
/// InData on the input channel, the Component converts them to data of type
/// OutData and sends it to the output channel. The thread ends once every
/// sender of the input channel is gone.
pub fn run_component<C: Component + Send + 'static>(
    mut component: Box<C>,
    input: Receiver<<C as Component>::InData>,
    output: Sender<<C as Component>::OutData>,
) -> JoinHandle<()>
where
    <C as Component>::InData: Send + 'static,
    <C as Component>::OutData: Send + 'static,
{
    thread::spawn(move || {
        while let Ok(data) = input.recv() {
            let out_data = component.convert(data);
            if let Err(error) = output.send(out_data) {
                debug!("{} : output dropped : {}.", component.to_string(), error);
            }
        }

        if let Err(component_error) = component.finalize() {
            warn!(
                "{} : error during terminating : {component_error}.",
                component.to_string(),
            );
        }
        info!("{} : terminated.", component.to_string());
    })
}

/// A filled ring buffer on its way to disk.
#[derive(Debug)]
pub struct CapturedBurst {
    pub burst_index: u64,
    pub report: CaptureReport,
    pub buffer: RingBuffer,
}

/// An emptied buffer on its way back, with the outcome of writing it.
#[derive(Debug)]
pub struct WrittenBurst {
    pub burst_index: u64,
    pub buffer: RingBuffer,
    pub outcome: Result<PathBuf>,
}

/// Writes each captured burst as a segment, then hands the emptied buffer
/// back for reuse.
pub struct SegmentWriter {
    kind: SensorKind,
    writer: ChunkWriter,
    depth: Arc<AtomicUsize>,
    written: u64,
    failed: u64,
}

impl SegmentWriter {
    /// `depth` counts bursts handed over but not yet written; the writer
    /// decrements it.
    pub fn new(kind: SensorKind, writer: ChunkWriter, depth: Arc<AtomicUsize>) -> Self {
        SegmentWriter {
            kind,
            writer,
            depth,
            written: 0,
            failed: 0,
        }
    }
}

impl Component for SegmentWriter {
    type InData = CapturedBurst;
    type OutData = WrittenBurst;

    fn convert(&mut self, mut input: CapturedBurst) -> WrittenBurst {
        let payload = SensorPayload::from_ring(&input.buffer, input.report.observed_rate);
        let outcome = self.writer.write_segment(input.burst_index, self.kind, payload);
        match &outcome {
            Ok(path) => {
                self.written += 1;
                debug!(
                    "{} : burst {} -> {path:?} ({} samples)",
                    self.to_string(),
                    input.burst_index,
                    input.report.sample_count
                );
            }
            Err(e) => {
                self.failed += 1;
                error!(
                    "{} : burst {} not written : {e}",
                    self.to_string(),
                    input.burst_index
                );
            }
        }
        input.buffer.reset();
        self.depth.fetch_sub(1, Ordering::SeqCst);
        WrittenBurst {
            burst_index: input.burst_index,
            buffer: input.buffer,
            outcome,
        }
    }

    fn finalize(&mut self) -> Result<()> {
        info!(
            "{} : {} segments written, {} failed",
            self.to_string(),
            self.written,
            self.failed
        );
        Ok(())
    }
}

impl ToString for SegmentWriter {
    fn to_string(&self) -> String {
        format!("{}-writer", self.kind)
    }
}
