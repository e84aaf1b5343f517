//! # qolab-rs
//!
//! Serial drivers for the instruments of a quantum-optics lab kit: a motorized
//! delay stage, a two-channel coincidence counter and the crystal temperature
//! controller of a bi-photon source.
//!
//! Every instrument speaks a line-based ASCII protocol over its own serial
//! port. This crate handles framing, per-instrument opcode tables, bounded
//! retries and the blocking poll loops (motion complete, temperature stable),
//! and exposes one typed driver per instrument.
//!
//! ## Features
//!
//! - **Typed drivers**: [`DelayStage`], [`CoincidenceCounter`] and
//!   [`TemperatureController`], each owning its port
//! - **Validation before I/O**: out-of-range positions, setpoints and windows
//!   never reach the wire
//! - **Exact readings**: device values are decoded as fixed-point decimals
//! - **Bounded blocking**: every retry count, poll interval and timeout comes
//!   from configuration, and long waits are cancellable
//! - **Deterministic tests**: [`sim::SimulatedTransport`] and [`ManualClock`]
//!   stand in for hardware and wall-clock time
//!
//! ## Examples
//!
//! ### Delay sweep
//!
//! ```rust,no_run
//! use qolab_rs::{CoincidenceCounter, DelayStage, LabConfig};
//!
//! let config = LabConfig::load("lab.toml")?;
//! let (Some(stage_config), Some(counter_config)) =
//!     (&config.delay_stage, &config.coincidence_counter)
//! else {
//!     return Ok(());
//! };
//!
//! let mut stage = DelayStage::open(stage_config)?;
//! let mut counter = CoincidenceCounter::open(counter_config)?;
//!
//! stage.home()?;
//! counter.configure(1000, 3)?;
//! for step in 0..10 {
//!     let position = stage.move_to(5.0 + f64::from(step) * 0.5)?;
//!     let counts = counter.read_counts()?;
//!     println!("{position:.4} mm: {} coincidences", counts.coincidences);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Waiting for the crystal oven
//!
//! ```rust,no_run
//! use qolab_rs::{TemperatureController, TemperatureControllerConfig};
//! use std::time::Duration;
//!
//! let mut oven = TemperatureController::open(&TemperatureControllerConfig::new("/dev/ttyUSB2"))?;
//! oven.set_setpoint(45.0)?;
//! let temperature = oven.wait_for_stable(0.05, Duration::from_secs(600))?;
//! println!("Phase matching at {temperature} °C");
//! # Ok::<(), qolab_rs::InstrumentError>(())
//! ```
//!
//! ### Without hardware
//!
//! ```rust
//! use qolab_rs::{sim, CoincidenceCounter, CoincidenceCounterConfig, SystemClock};
//! use std::sync::Arc;
//!
//! let mut counter = CoincidenceCounter::with_transport(
//!     sim::coincidence_counter([12, 9, 3]),
//!     &CoincidenceCounterConfig::new("sim"),
//!     Arc::new(SystemClock),
//! )?;
//! counter.configure(100, 3)?;
//! assert_eq!(counter.read_counts()?.coincidences, 3);
//! # Ok::<(), qolab_rs::InstrumentError>(())
//! ```

pub mod clock;
pub mod codec;
pub mod coincidence_counter;
pub mod config;
pub mod delay_stage;
pub mod dialect;
pub mod error;
pub mod instrument;
pub mod session;
pub mod sim;
pub mod temperature_controller;
pub mod transport;

// Re-export the main types for convenience
pub use error::{InstrumentError, Result};

pub use transport::{SerialSettings, SerialTransport, Transport};

pub use clock::{CancelToken, Clock, ManualClock, SystemClock};

pub use config::{
    CoincidenceCounterConfig, ConfigError, DelayStageConfig, LabConfig,
    TemperatureControllerConfig,
};

pub use instrument::{Instrument, InstrumentKind};

pub use delay_stage::{DelayStage, HomingState};

pub use coincidence_counter::{CoincidenceCounter, CounterSettings, Counts};

pub use temperature_controller::{HeatingMode, Stability, TemperatureController};
