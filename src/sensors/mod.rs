//! Concrete measurement models.

pub mod angular_velocity;
pub mod joint_position;

pub use angular_velocity::AngularVelocitySensor;
pub use joint_position::JointPositionSensor;
