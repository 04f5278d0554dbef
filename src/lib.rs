//! lightlogger is the capture software of a wearable light logger. A
//! handful of sensors with very different rates and sample sizes (a world
//! camera, a pupil camera, a spectral/IMU board and an ambient light ADC)
//! each run in their own controller process. The controllers record in
//! fixed-length bursts that start together, and every burst ends up as one
//! self-describing `chunk_<N>` file.
//!
//! The [orchestrator] launches the controllers and keeps them in lock-step
//! through the [rendezvous] handshake. Each [controller] fills a
//! [ring_buffer] from its [device] and hands it to a writer thread, and the
//! [chunk] module defines the on-disk format together with its reader.

pub mod args;
pub mod capture;
pub mod chunk;
pub mod component;
pub mod config;
pub mod control;
pub mod controller;
pub mod device;
pub mod error;
pub mod orchestrator;
pub mod rendezvous;
pub mod ring_buffer;
pub mod sensor;
