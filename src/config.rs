use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EkfError, EkfResult};

/// Noise and timing parameters of an arm estimator.
///
/// Missing fields in a JSON document fall back to [`Default`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Control period [seconds]
    pub dt: f64,
    /// Encoder noise [rad²]
    pub joint_position_variance: f64,
    /// Gyro noise [rad²/s²]
    pub angular_velocity_variance: f64,
    /// Gyro bias drift per tick [rad²/s²]
    pub gyro_bias_variance: f64,
    /// Joint acceleration process noise [rad²/s⁴]
    pub joint_acceleration_variance: f64,
    /// Diagonal of the initial error covariance
    pub initial_covariance: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            dt: 0.001,
            joint_position_variance: 1e-6,
            angular_velocity_variance: 1e-4,
            gyro_bias_variance: 1e-8,
            joint_acceleration_variance: 1e4,
            initial_covariance: 1.0,
        }
    }
}

impl EstimatorConfig {
    pub fn from_json_str(json: &str) -> EkfResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| EkfError::InvalidArgument(format!("invalid estimator config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> EkfResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            EkfError::InvalidArgument(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> EkfResult<()> {
        if !(self.dt > 0.0) || !self.dt.is_finite() {
            return Err(EkfError::InvalidArgument(format!(
                "dt must be positive, got {}",
                self.dt
            )));
        }
        let variances = [
            ("joint_position_variance", self.joint_position_variance),
            ("angular_velocity_variance", self.angular_velocity_variance),
            ("gyro_bias_variance", self.gyro_bias_variance),
            ("joint_acceleration_variance", self.joint_acceleration_variance),
            ("initial_covariance", self.initial_covariance),
        ];
        for (field, value) in variances {
            if !(value >= 0.0) || !value.is_finite() {
                return Err(EkfError::InvalidArgument(format!(
                    "{field} must be a finite non-negative number, got {value}"
                )));
            }
        }
        Ok(())
    }
}
