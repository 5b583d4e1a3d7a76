//! Concrete state units.

pub mod random_walk;
pub mod robot;

pub use random_walk::RandomWalkState;
pub use robot::{position_element, velocity_element, RobotState};
