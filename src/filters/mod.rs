//! Extended Kalman filter core
//!
//! Composable state and measurement models, the matrix primitives of the
//! Kalman recursion, and the estimator that ties them together.

pub mod estimator;
pub mod matrix_ops;
pub mod sensor;
pub mod state;

pub use estimator::{EstimatorStats, StateEstimator, TickOutcome, TickTimer};
pub use matrix_ops::FilterMatrixOps;
pub use sensor::{ComposedSensor, Sensor, SensorHandle};
pub use state::{ComposedState, State, StateHandle};
