//! Composable extended Kalman filter for articulated robots.
//!
//! Concrete [`State`] and [`Sensor`] units are stacked into a
//! [`ComposedState`] and a [`ComposedSensor`]; the [`StateEstimator`] runs one
//! predict/correct step per control tick over the assembled block matrices.

pub mod config;
pub mod error;
pub mod filters;
pub mod sensors;
pub mod simulation;
pub mod states;
pub mod types;

pub use config::EstimatorConfig;
pub use error::{EkfError, EkfResult};
pub use filters::{ComposedSensor, ComposedState, Sensor, State, StateEstimator, TickOutcome};
