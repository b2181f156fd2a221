//! Core library for the lab_sweep application.
//!
//! This library contains the device traits and drivers, the calibrated output
//! and buffered input layers, and the measurement routines (grid search and
//! time series) that drive them. It is used by the `lab_sweep` binary, both
//! by the egui control panel and by the headless subcommands.
//!
//! A typical headless run:
//!
//! ```no_run
//! use lab_sweep::config::Settings;
//! use lab_sweep::lab::Lab;
//! use lab_sweep::routine::{ui::UiDispatcher, CancelToken, RoutineContext};
//!
//! # async fn run() -> lab_sweep::error::AppResult<()> {
//! let settings = Settings::load(None)?;
//! let lab = Lab::connect(&settings).await?;
//! let (ui, _queue) = UiDispatcher::channel();
//! let outcome = lab
//!     .grid_search()?
//!     .execute(&RoutineContext::new(CancelToken::new(), ui))
//!     .await?;
//! println!("{} points measured", outcome.measurements);
//! lab.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod calibration;
pub mod config;
pub mod data;
pub mod error;
#[cfg(feature = "gui")]
pub mod gui;
pub mod input;
pub mod instrument;
pub mod lab;
pub mod output;
pub mod routine;
