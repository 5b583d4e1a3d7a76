use crate::error::{EkfError, EkfResult};
use crate::filters::sensor::{check_measurement_len, Sensor};
use crate::filters::state::ComposedState;
use crate::states::position_element;
use crate::types::{MatViewMut, VectorViewMut};

/// Encoder reading of a single joint angle.
///
/// `H` has a single 1 in the column of `<joint>/q`. The per-sample noise is
/// the configured variance scaled by `1/√dt`.
#[derive(Debug, Clone)]
pub struct JointPositionSensor {
    name: String,
    joint: String,
    element: String,
    variance: f64,
    sqrt_hz: f64,
    measurement: Option<f64>,
}

impl JointPositionSensor {
    /// Creates a sensor named after its joint.
    pub fn new(joint: &str, dt: f64, variance: f64) -> EkfResult<Self> {
        Self::named(joint, joint, dt, variance)
    }

    pub fn named(name: &str, joint: &str, dt: f64, variance: f64) -> EkfResult<Self> {
        if !(dt > 0.0) {
            return Err(EkfError::InvalidArgument(format!("dt must be positive, got {dt}")));
        }
        Ok(Self {
            name: name.to_string(),
            joint: joint.to_string(),
            element: position_element(joint),
            variance,
            sqrt_hz: 1.0 / dt.sqrt(),
            measurement: None,
        })
    }

    pub fn joint(&self) -> &str {
        &self.joint
    }

    pub fn set_joint_position_measurement(&mut self, q: f64) {
        self.measurement = Some(q);
    }
}

impl Sensor for JointPositionSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn measurement_size(&self) -> usize {
        1
    }

    fn fill_jacobian_and_residual(
        &self,
        mut jacobian: MatViewMut<'_>,
        mut residual: VectorViewMut<'_>,
        state: &ComposedState,
    ) -> EkfResult<()> {
        let q = self
            .measurement
            .ok_or_else(|| EkfError::UnsetMeasurement(self.name.clone()))?;
        let (index, predicted) = state.require_element(&self.element)?;

        jacobian.fill(0.0);
        jacobian[(0, index)] = 1.0;
        residual[0] = q - predicted;
        Ok(())
    }

    fn fill_r_matrix(&self, mut out: MatViewMut<'_>) {
        out[(0, 0)] = self.variance * self.sqrt_hz;
    }

    fn set_measurement(&mut self, values: &[f64]) -> EkfResult<()> {
        check_measurement_len(&self.name, values, 1)?;
        self.set_joint_position_measurement(values[0]);
        Ok(())
    }

    fn check_configuration(&self, state: &ComposedState) -> EkfResult<()> {
        state.require_index(&self.element).map(|_| ())
    }
}
