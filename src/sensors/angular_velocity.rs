use nalgebra::Vector3;

use crate::error::{EkfError, EkfResult};
use crate::filters::sensor::{check_measurement_len, Sensor};
use crate::filters::state::{ComposedState, State};
use crate::states::{velocity_element, RandomWalkState};
use crate::types::{MatViewMut, VectorViewMut};

/// Gyro rigidly attached to a link of a serial chain.
///
/// The body rate is modelled as `ω = Σ axis_j · qd_j + b`, where the axes are
/// the joint axes expressed in the gyro frame and `b` is a slowly drifting
/// bias. The bias lives in a [`RandomWalkState`] named `"<name>_bias"` that
/// is handed to the estimator at assembly.
#[derive(Debug)]
pub struct AngularVelocitySensor {
    name: String,
    /// Joint velocity element and the joint axis it spins about
    axes: Vec<(String, Vector3<f64>)>,
    bias_elements: [String; 3],
    variance: f64,
    sqrt_hz: f64,
    measurement: Option<Vector3<f64>>,
    bias_state: Option<RandomWalkState>,
}

impl AngularVelocitySensor {
    pub fn new(name: &str, dt: f64, variance: f64, bias_variance: f64) -> EkfResult<Self> {
        if !(dt > 0.0) {
            return Err(EkfError::InvalidArgument(format!("dt must be positive, got {dt}")));
        }
        let bias = RandomWalkState::new(format!("{name}_bias"), 3, bias_variance);
        Ok(Self {
            name: name.to_string(),
            axes: Vec::new(),
            bias_elements: [0, 1, 2].map(|i| bias.element_name(i)),
            variance,
            sqrt_hz: 1.0 / dt.sqrt(),
            measurement: None,
            bias_state: Some(bias),
        })
    }

    /// Registers a joint between the base and the gyro. `axis` need not be
    /// normalized.
    pub fn add_joint(&mut self, joint: &str, axis: Vector3<f64>) {
        self.axes.push((velocity_element(joint), axis));
    }

    pub fn with_joint(mut self, joint: &str, axis: Vector3<f64>) -> Self {
        self.add_joint(joint, axis);
        self
    }

    pub fn bias_state_name(&self) -> String {
        format!("{}_bias", self.name)
    }

    pub fn set_angular_velocity_measurement(&mut self, omega: Vector3<f64>) {
        self.measurement = Some(omega);
    }

    /// Current bias estimate read back from the estimator state.
    pub fn bias(&self, state: &ComposedState) -> EkfResult<Vector3<f64>> {
        let mut bias = Vector3::zeros();
        for (axis, element) in self.bias_elements.iter().enumerate() {
            bias[axis] = state.require_element(element)?.1;
        }
        Ok(bias)
    }
}

impl Sensor for AngularVelocitySensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn measurement_size(&self) -> usize {
        3
    }

    fn fill_jacobian_and_residual(
        &self,
        mut jacobian: MatViewMut<'_>,
        mut residual: VectorViewMut<'_>,
        state: &ComposedState,
    ) -> EkfResult<()> {
        let measured = self
            .measurement
            .ok_or_else(|| EkfError::UnsetMeasurement(self.name.clone()))?;

        jacobian.fill(0.0);
        let mut predicted = Vector3::zeros();
        for (element, axis) in &self.axes {
            let (index, qd) = state.require_element(element)?;
            for row in 0..3 {
                jacobian[(row, index)] += axis[row];
            }
            predicted += axis * qd;
        }
        for (row, element) in self.bias_elements.iter().enumerate() {
            let (index, bias) = state.require_element(element)?;
            jacobian[(row, index)] = 1.0;
            predicted[row] += bias;
        }

        residual.copy_from(&(measured - predicted));
        Ok(())
    }

    fn fill_r_matrix(&self, mut out: MatViewMut<'_>) {
        out.fill_with_identity();
        out *= self.variance * self.sqrt_hz;
    }

    fn set_measurement(&mut self, values: &[f64]) -> EkfResult<()> {
        check_measurement_len(&self.name, values, 3)?;
        self.set_angular_velocity_measurement(Vector3::from_column_slice(values));
        Ok(())
    }

    fn check_configuration(&self, state: &ComposedState) -> EkfResult<()> {
        self.axes
            .iter()
            .map(|(element, _)| element)
            .chain(&self.bias_elements)
            .try_for_each(|element| state.require_index(element).map(|_| ()))
    }

    fn take_sensor_state(&mut self) -> Option<Box<dyn State>> {
        self.bias_state
            .take()
            .map(|bias| Box::new(bias) as Box<dyn State>)
    }
}
