//! Measurement models and their stacked composition.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{EkfError, EkfResult};
use crate::filters::state::{ComposedState, State};
use crate::types::{full_view_mut, reshape, reshape_vector, vector_view_mut, Mat, MatViewMut, Vector, VectorViewMut};

static NEXT_COMPOSITE_ID: AtomicU64 = AtomicU64::new(1);

/// A unit of measurement with a linearized observation model relative to the
/// full composed state.
pub trait Sensor: Send {
    fn name(&self) -> &str;

    /// Number of measured values, fixed after construction.
    fn measurement_size(&self) -> usize;

    /// Writes the `m×n` Jacobian and the `m` residual (measured minus
    /// predicted) into views of exactly that shape. Columns this sensor does
    /// not observe must be left at zero.
    ///
    /// Fails with [`EkfError::UnsetMeasurement`] before the first reading and
    /// with [`EkfError::Configuration`] if a referenced element is missing.
    fn fill_jacobian_and_residual(
        &self,
        jacobian: MatViewMut<'_>,
        residual: VectorViewMut<'_>,
        state: &ComposedState,
    ) -> EkfResult<()>;

    /// Writes the `m×m` measurement noise covariance.
    fn fill_r_matrix(&self, out: MatViewMut<'_>);

    /// Records the latest raw reading, `measurement_size` values.
    fn set_measurement(&mut self, values: &[f64]) -> EkfResult<()>;

    /// Checks that every element this sensor observes exists in `state`.
    fn check_configuration(&self, _state: &ComposedState) -> EkfResult<()> {
        Ok(())
    }

    /// Hands over the sensor-local state (e.g. a bias) that has to be
    /// estimated jointly with the robot. Called once at assembly.
    fn take_sensor_state(&mut self) -> Option<Box<dyn State>> {
        None
    }

    fn robot_jacobian_and_residual(
        &self,
        jacobian: &mut Mat,
        residual: &mut Vector,
        state: &ComposedState,
    ) -> EkfResult<()> {
        reshape(jacobian, self.measurement_size(), state.size());
        reshape_vector(residual, self.measurement_size());
        self.fill_jacobian_and_residual(full_view_mut(jacobian), vector_view_mut(residual), state)
    }

    fn r_matrix(&self, out: &mut Mat) {
        reshape(out, self.measurement_size(), self.measurement_size());
        self.fill_r_matrix(full_view_mut(out));
    }
}

/// Fails with [`EkfError::InvalidArgument`] unless `values` holds exactly
/// one entry per measured value of `sensor`.
pub(crate) fn check_measurement_len(sensor: &str, values: &[f64], expected: usize) -> EkfResult<()> {
    if values.len() != expected {
        return Err(EkfError::InvalidArgument(format!(
            "sensor '{sensor}' expects {expected} values, got {}",
            values.len()
        )));
    }
    Ok(())
}

/// Identifies a sensor registered with a [`ComposedSensor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SensorHandle {
    owner: u64,
    slot: usize,
}

/// Stacks an ordered set of sensors into one observation.
///
/// Jacobians and residuals are stacked row-wise in insertion order, `R` is
/// block diagonal (sensors are independent). Sensor-local states are collected
/// into an internal [`ComposedState`] that the estimator appends to the robot
/// state before any Jacobian is sized.
pub struct ComposedSensor {
    id: u64,
    name: String,
    sensors: Vec<Box<dyn Sensor>>,
    row_indices: Vec<usize>,
    measurement_size: usize,
    sensor_state: ComposedState,
}

impl ComposedSensor {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let sensor_state = ComposedState::new(format!("{name}State"));
        Self {
            id: NEXT_COMPOSITE_ID.fetch_add(1, Ordering::Relaxed),
            name,
            sensors: Vec::new(),
            row_indices: Vec::new(),
            measurement_size: 0,
            sensor_state,
        }
    }

    pub fn from_sensors(name: impl Into<String>, sensors: Vec<Box<dyn Sensor>>) -> Self {
        let mut composed = Self::new(name);
        for sensor in sensors {
            composed.add_sensor(sensor);
        }
        composed
    }

    /// Appends `sensor` below all existing ones and adopts its sensor state.
    pub fn add_sensor(&mut self, mut sensor: Box<dyn Sensor>) -> SensorHandle {
        if let Some(state) = sensor.take_sensor_state() {
            self.sensor_state.add_state(state);
        }

        let handle = SensorHandle {
            owner: self.id,
            slot: self.sensors.len(),
        };
        self.row_indices.push(self.measurement_size);
        self.measurement_size += sensor.measurement_size();
        self.sensors.push(sensor);
        handle
    }

    /// First row of `handle`'s block in the stacked observation.
    pub fn row_index(&self, handle: SensorHandle) -> EkfResult<usize> {
        if handle.owner != self.id {
            return Err(EkfError::NotFound(format!(
                "sensor {handle:?} is not part of '{}'",
                self.name
            )));
        }
        self.row_indices
            .get(handle.slot)
            .copied()
            .ok_or_else(|| EkfError::NotFound(format!("sensor {handle:?} is not part of '{}'", self.name)))
    }

    /// States collected from the sensors that have not been taken yet.
    pub fn sensor_state(&self) -> &ComposedState {
        &self.sensor_state
    }

    /// Moves the collected sensor states out, leaving an empty composite.
    pub fn take_composed_state(&mut self) -> ComposedState {
        let empty = ComposedState::new(format!("{}State", self.name));
        std::mem::replace(&mut self.sensor_state, empty)
    }

    pub fn sensor(&self, name: &str) -> EkfResult<&(dyn Sensor + 'static)> {
        self.sensors
            .iter()
            .find(|sensor| sensor.name() == name)
            .map(|sensor| sensor.as_ref())
            .ok_or_else(|| EkfError::NotFound(format!("no sensor '{name}' in '{}'", self.name)))
    }

    pub fn sensor_mut(&mut self, name: &str) -> EkfResult<&mut (dyn Sensor + 'static)> {
        let composite = &self.name;
        match self.sensors.iter_mut().find(|sensor| sensor.name() == name) {
            Some(sensor) => Ok(sensor.as_mut()),
            None => Err(EkfError::NotFound(format!("no sensor '{name}' in '{composite}'"))),
        }
    }

    /// Direct children with their first row, in insertion order.
    pub fn sensors(&self) -> impl Iterator<Item = (usize, &(dyn Sensor + 'static))> + '_ {
        self.row_indices
            .iter()
            .copied()
            .zip(self.sensors.iter().map(|sensor| sensor.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }
}

impl Sensor for ComposedSensor {
    fn name(&self) -> &str {
        &self.name
    }

    fn measurement_size(&self) -> usize {
        self.measurement_size
    }

    fn fill_jacobian_and_residual(
        &self,
        mut jacobian: MatViewMut<'_>,
        mut residual: VectorViewMut<'_>,
        state: &ComposedState,
    ) -> EkfResult<()> {
        for (row, sensor) in self.row_indices.iter().zip(&self.sensors) {
            let m = sensor.measurement_size();
            sensor.fill_jacobian_and_residual(jacobian.rows_mut(*row, m), residual.rows_mut(*row, m), state)?;
        }
        Ok(())
    }

    fn fill_r_matrix(&self, mut out: MatViewMut<'_>) {
        out.fill(0.0);
        for (row, sensor) in self.row_indices.iter().zip(&self.sensors) {
            let m = sensor.measurement_size();
            sensor.fill_r_matrix(out.view_mut((*row, *row), (m, m)));
        }
    }

    fn set_measurement(&mut self, values: &[f64]) -> EkfResult<()> {
        check_measurement_len(&self.name, values, self.measurement_size)?;
        for (row, sensor) in self.row_indices.iter().zip(&mut self.sensors) {
            let m = sensor.measurement_size();
            sensor.set_measurement(&values[*row..*row + m])?;
        }
        Ok(())
    }

    fn check_configuration(&self, state: &ComposedState) -> EkfResult<()> {
        self.sensors
            .iter()
            .try_for_each(|sensor| sensor.check_configuration(state))
    }

    fn take_sensor_state(&mut self) -> Option<Box<dyn State>> {
        if self.sensor_state.is_empty() {
            return None;
        }
        Some(Box::new(self.take_composed_state()))
    }
}
