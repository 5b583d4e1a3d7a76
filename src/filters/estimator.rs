//! Extended Kalman filter over a composed state and a composed sensor.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::EstimatorConfig;
use crate::error::EkfResult;
use crate::filters::matrix_ops::FilterMatrixOps;
use crate::filters::sensor::{ComposedSensor, Sensor};
use crate::filters::state::{ComposedState, State};
use crate::types::{empty_mat, empty_vector, set_identity, Mat, Vector};

/// How a tick ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TickOutcome {
    /// Predicted and corrected with the current measurements.
    Corrected,
    /// The innovation covariance was singular; only the prediction was kept.
    IntegrateOnly,
}

// ===== Timing =====

/// Wall-clock duration of `compute()` calls.
#[derive(Debug, Clone, Default)]
pub struct TickTimer {
    started: Option<Instant>,
    count: u64,
    last: Duration,
    max: Duration,
    total: Duration,
}

impl TickTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_measurement(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Returns the time since the matching `start_measurement`, or zero if
    /// none is pending.
    pub fn stop_measurement(&mut self) -> Duration {
        let Some(started) = self.started.take() else {
            return Duration::ZERO;
        };
        let elapsed = started.elapsed();
        self.count += 1;
        self.last = elapsed;
        self.max = self.max.max(elapsed);
        self.total += elapsed;
        elapsed
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn last(&self) -> Duration {
        self.last
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        self.total.div_f64(self.count as f64)
    }
}

/// Snapshot of estimator bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EstimatorStats {
    pub ticks: u64,
    pub corrected_ticks: u64,
    pub integrate_only_ticks: u64,
    pub last_tick_us: f64,
    pub max_tick_us: f64,
    pub mean_tick_us: f64,
}

// ===== Estimator =====

/// Runs one predict/correct step per [`compute`](Self::compute) call.
///
/// The estimated state is `[robot_state, sensor states...]`: every state a
/// sensor hands over at assembly (e.g. a gyro bias) is estimated jointly with
/// the robot. All matrices are owned buffers reshaped in place, so a tick
/// with unchanged dimensions does not allocate.
pub struct StateEstimator {
    state: ComposedState,
    sensor: ComposedSensor,
    ops: FilterMatrixOps,

    a: Mat,
    q: Mat,
    h: Mat,
    r: Mat,
    k: Mat,
    residual: Vector,
    x_prior: Vector,
    x_posterior: Vector,
    p_prior: Mat,
    p_posterior: Mat,

    timer: TickTimer,
    corrected_ticks: u64,
    integrate_only_ticks: u64,
}

impl StateEstimator {
    pub fn new(
        robot_state: Box<dyn State>,
        sensors: Vec<Box<dyn Sensor>>,
        config: &EstimatorConfig,
    ) -> EkfResult<Self> {
        config.validate()?;

        let mut sensor = ComposedSensor::from_sensors("sensors", sensors);
        let mut state = ComposedState::new("estimator");
        state.add_state(robot_state);
        if let Some(sensor_state) = sensor.take_sensor_state() {
            state.add_state(sensor_state);
        }
        sensor.check_configuration(&state)?;

        let n = state.size();
        let mut p_posterior = empty_mat();
        set_identity(&mut p_posterior, n);
        p_posterior *= config.initial_covariance;

        let mut x_posterior = empty_vector();
        state.state_vector(&mut x_posterior);

        log::info!(
            "Estimator assembled: {} states, {} measurements from {} sensors",
            n,
            sensor.measurement_size(),
            sensor.len()
        );
        for (start, child) in state.children() {
            log::info!("  [{:>3}] {} ({} elements)", start, child.name(), child.size());
        }

        Ok(Self {
            state,
            sensor,
            ops: FilterMatrixOps::new(),
            a: empty_mat(),
            q: empty_mat(),
            h: empty_mat(),
            r: empty_mat(),
            k: empty_mat(),
            residual: empty_vector(),
            x_prior: empty_vector(),
            x_posterior,
            p_prior: empty_mat(),
            p_posterior,
            timer: TickTimer::new(),
            corrected_ticks: 0,
            integrate_only_ticks: 0,
        })
    }

    /// Runs one tick.
    ///
    /// If a sensor cannot produce its residual (e.g. no reading yet) the
    /// predicted estimate is kept and the error is returned.
    pub fn compute(&mut self) -> EkfResult<TickOutcome> {
        self.timer.start_measurement();
        let outcome = self.step();
        let elapsed = self.timer.stop_measurement();
        log::trace!("Tick took {} us", elapsed.as_micros());

        match outcome {
            Ok(TickOutcome::Corrected) => self.corrected_ticks += 1,
            Ok(TickOutcome::IntegrateOnly) => self.integrate_only_ticks += 1,
            Err(_) => {}
        }
        outcome
    }

    fn step(&mut self) -> EkfResult<TickOutcome> {
        // Predict
        self.state.predict();
        self.state.state_vector(&mut self.x_prior);
        self.state.f_matrix(&mut self.a);
        self.state.q_matrix(&mut self.q);
        self.ops
            .predict_error_covariance(&mut self.p_prior, &self.a, &self.p_posterior, &self.q);

        // Correct
        if let Err(e) = self
            .sensor
            .robot_jacobian_and_residual(&mut self.h, &mut self.residual, &self.state)
        {
            self.p_posterior.copy_from(&self.p_prior);
            return Err(e);
        }
        self.sensor.r_matrix(&mut self.r);

        if !self
            .ops
            .compute_kalman_gain(&mut self.k, &self.p_prior, &self.h, &self.r)
        {
            log::warn!("Inversion failed, integrating only");
            self.p_posterior.copy_from(&self.p_prior);
            return Ok(TickOutcome::IntegrateOnly);
        }

        self.ops
            .update_state(&mut self.x_posterior, &self.k, &self.residual, &self.x_prior);
        self.ops
            .update_error_covariance(&mut self.p_posterior, &self.k, &self.h, &self.p_prior);
        self.state.set_state_vector(&self.x_posterior)?;
        Ok(TickOutcome::Corrected)
    }

    pub fn state(&self) -> &ComposedState {
        &self.state
    }

    /// Posterior error covariance of the last tick.
    pub fn covariance(&self) -> &Mat {
        &self.p_posterior
    }

    pub fn state_vector(&self, out: &mut Vector) {
        self.state.state_vector(out);
    }

    /// Current estimate of a named element such as `"elbow/q"`.
    pub fn element(&self, name: &str) -> EkfResult<f64> {
        self.state.require_element(name).map(|(_, value)| value)
    }

    pub fn sensor(&self) -> &ComposedSensor {
        &self.sensor
    }

    pub fn sensor_mut(&mut self, name: &str) -> EkfResult<&mut (dyn Sensor + 'static)> {
        self.sensor.sensor_mut(name)
    }

    pub fn stats(&self) -> EstimatorStats {
        EstimatorStats {
            ticks: self.timer.count(),
            corrected_ticks: self.corrected_ticks,
            integrate_only_ticks: self.integrate_only_ticks,
            last_tick_us: self.timer.last().as_secs_f64() * 1e6,
            max_tick_us: self.timer.max().as_secs_f64() * 1e6,
            mean_tick_us: self.timer.mean().as_secs_f64() * 1e6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    use crate::error::EkfError;
    use crate::filters::sensor::tests::TestSensor;
    use crate::filters::state::tests::TestState;
    use crate::sensors::{AngularVelocitySensor, JointPositionSensor};
    use crate::states::RobotState;
    use crate::types::{MatViewMut, VectorViewMut};

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn scalar_state(x: f64, q: f64) -> TestState {
        TestState {
            name: "x".to_string(),
            x: Vector::from_element(1, x),
            f: Mat::from_element(1, 1, 1.0),
            q: Mat::from_element(1, 1, q),
            nan_on_predict: false,
        }
    }

    fn config() -> EstimatorConfig {
        EstimatorConfig {
            initial_covariance: 1.0,
            ..Default::default()
        }
    }

    /// Scalar state that drifts by +1 per tick.
    struct DriftState {
        x: Vector,
    }

    impl State for DriftState {
        fn name(&self) -> &str {
            "drift"
        }

        fn size(&self) -> usize {
            1
        }

        fn predict(&mut self) {
            self.x[0] += 1.0;
        }

        fn fill_state_vector(&self, mut out: VectorViewMut<'_>) {
            out.copy_from(&self.x);
        }

        fn assign_state_vector(&mut self, x: crate::types::VectorView<'_>) -> EkfResult<()> {
            self.x.copy_from(&x);
            Ok(())
        }

        fn fill_f_matrix(&self, mut out: MatViewMut<'_>) {
            out.fill_with_identity();
        }

        fn fill_q_matrix(&self, mut out: MatViewMut<'_>) {
            out.fill(0.01);
        }

        fn element(&self, index: usize) -> Option<f64> {
            self.x.get(index).copied()
        }
    }

    /// Sees nothing and claims to be perfect, so `S = 0`.
    struct BlindSensor;

    impl Sensor for BlindSensor {
        fn name(&self) -> &str {
            "blind"
        }

        fn measurement_size(&self) -> usize {
            1
        }

        fn fill_jacobian_and_residual(
            &self,
            mut jacobian: MatViewMut<'_>,
            mut residual: VectorViewMut<'_>,
            _state: &ComposedState,
        ) -> EkfResult<()> {
            jacobian.fill(0.0);
            residual.fill(3.0);
            Ok(())
        }

        fn fill_r_matrix(&self, mut out: MatViewMut<'_>) {
            out.fill(0.0);
        }

        fn set_measurement(&mut self, _values: &[f64]) -> EkfResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_scalar_convergence() {
        init_logger();
        let sensor = TestSensor::new("z", &["x/0"], 0.04);
        let mut estimator = StateEstimator::new(
            Box::new(scalar_state(0.0, 0.01)),
            vec![Box::new(sensor) as Box<dyn Sensor>],
            &config(),
        )
        .unwrap();

        let mut last_p = estimator.covariance()[(0, 0)];
        for tick in 0..200 {
            let z = 5.0 - 5.0 * 0.9f64.powi(tick);
            estimator.sensor_mut("z").unwrap().set_measurement(&[z]).unwrap();
            assert_eq!(estimator.compute().unwrap(), TickOutcome::Corrected);

            let p = estimator.covariance()[(0, 0)];
            assert!(p <= last_p + 1e-12, "covariance grew at tick {tick}: {last_p} -> {p}");
            last_p = p;
        }

        assert!((estimator.element("x/0").unwrap() - 5.0).abs() < 1e-3);
        // Steady state of p = (p + 0.01) * 0.04 / (p + 0.05)
        let steady = (-0.01 + (0.0001f64 + 0.0016).sqrt()) / 2.0;
        assert!((last_p - steady).abs() < 1e-9);
    }

    #[test]
    fn test_tick_matches_closed_form() {
        init_logger();
        let dt = 0.01;
        let mut arm = RobotState::with_joints("arm", &["shoulder", "elbow"], dt, 4.0).unwrap();
        arm.set_joint("shoulder", 0.1, 0.8).unwrap();
        arm.set_joint("elbow", -0.3, -0.5).unwrap();
        let gyro = AngularVelocitySensor::new("imu", dt, 1e-3, 1e-6)
            .unwrap()
            .with_joint("shoulder", Vector3::new(0.0, 0.6, 0.8))
            .with_joint("elbow", Vector3::z());
        let sensors: Vec<Box<dyn Sensor>> = vec![
            Box::new(JointPositionSensor::new("shoulder", dt, 1e-4).unwrap()),
            Box::new(JointPositionSensor::new("elbow", dt, 2e-4).unwrap()),
            Box::new(gyro),
        ];
        let mut estimator = StateEstimator::new(Box::new(arm), sensors, &config()).unwrap();
        let n = estimator.state().size();
        assert_eq!(n, 7);
        assert_eq!(estimator.sensor().measurement_size(), 5);

        // The second tick starts from a dense posterior covariance.
        let readings = [[0.11, -0.31, 0.02, 0.5, 0.2], [0.12, -0.32, -0.01, 0.48, 0.25]];
        for z in readings {
            let mut x = empty_vector();
            estimator.state_vector(&mut x);
            let p = estimator.covariance().clone();
            let mut f = empty_mat();
            let mut q = empty_mat();
            estimator.state().f_matrix(&mut f);
            estimator.state().q_matrix(&mut q);
            assert_ne!(f, Mat::identity(n, n));
            assert_ne!(f, f.transpose());

            estimator.sensor_mut("shoulder").unwrap().set_measurement(&z[0..1]).unwrap();
            estimator.sensor_mut("elbow").unwrap().set_measurement(&z[1..2]).unwrap();
            estimator.sensor_mut("imu").unwrap().set_measurement(&z[2..5]).unwrap();
            assert_eq!(estimator.compute().unwrap(), TickOutcome::Corrected);

            // Both sensors are linear, so H does not depend on where it is taken.
            let mut h = empty_mat();
            let mut residual = empty_vector();
            let mut r = empty_mat();
            estimator
                .sensor()
                .robot_jacobian_and_residual(&mut h, &mut residual, estimator.state())
                .unwrap();
            estimator.sensor().r_matrix(&mut r);
            assert_eq!(h.shape(), (5, n));

            let x_prior = &f * &x;
            let p_prior = &f * &p * f.transpose() + &q;
            let s = &h * &p_prior * h.transpose() + &r;
            let k = &p_prior * h.transpose() * s.try_inverse().unwrap();
            let x_expected = &x_prior + &k * (Vector::from_row_slice(&z) - &h * &x_prior);
            let p_expected = (Mat::identity(n, n) - &k * &h) * &p_prior;

            let mut x_posterior = empty_vector();
            estimator.state_vector(&mut x_posterior);
            assert_relative_eq!(x_posterior, x_expected, epsilon = 1e-9);
            assert_relative_eq!(*estimator.covariance(), p_expected, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_failed_gain_keeps_prediction() {
        init_logger();
        let mut estimator = StateEstimator::new(
            Box::new(DriftState { x: Vector::from_element(1, 2.0) }),
            vec![Box::new(BlindSensor) as Box<dyn Sensor>],
            &config(),
        )
        .unwrap();

        assert_eq!(estimator.compute().unwrap(), TickOutcome::IntegrateOnly);
        assert_eq!(estimator.element("drift").ok(), None);
        let mut x = empty_vector();
        estimator.state_vector(&mut x);
        assert_eq!(x[0], 3.0);
        assert!((estimator.covariance()[(0, 0)] - 1.01).abs() < 1e-12);

        assert_eq!(estimator.compute().unwrap(), TickOutcome::IntegrateOnly);
        estimator.state_vector(&mut x);
        assert_eq!(x[0], 4.0);
        assert!((estimator.covariance()[(0, 0)] - 1.02).abs() < 1e-12);

        let stats = estimator.stats();
        assert_eq!(stats.ticks, 2);
        assert_eq!(stats.integrate_only_ticks, 2);
        assert_eq!(stats.corrected_ticks, 0);
    }

    #[test]
    fn test_unset_measurement_keeps_prediction() {
        let sensor = TestSensor::new("z", &["x/0"], 0.04);
        let mut estimator = StateEstimator::new(
            Box::new(scalar_state(1.0, 0.5)),
            vec![Box::new(sensor) as Box<dyn Sensor>],
            &config(),
        )
        .unwrap();

        assert_eq!(estimator.compute(), Err(EkfError::UnsetMeasurement("z".to_string())));
        assert_eq!(estimator.element("x/0").unwrap(), 1.0);
        assert!((estimator.covariance()[(0, 0)] - 1.5).abs() < 1e-12);
        assert_eq!(estimator.stats().ticks, 1);
        assert_eq!(estimator.stats().corrected_ticks, 0);
    }

    #[test]
    fn test_missing_element_fails_assembly() {
        let sensor = TestSensor::new("z", &["y/0"], 0.04);
        let result = StateEstimator::new(
            Box::new(scalar_state(0.0, 0.01)),
            vec![Box::new(sensor) as Box<dyn Sensor>],
            &config(),
        );
        assert!(matches!(result, Err(EkfError::Configuration(_))));
    }

    #[test]
    fn test_invalid_config() {
        let bad = EstimatorConfig {
            dt: -1.0,
            ..Default::default()
        };
        let result = StateEstimator::new(Box::new(scalar_state(0.0, 0.01)), Vec::new(), &bad);
        assert!(matches!(result, Err(EkfError::InvalidArgument(_))));
    }

    #[test]
    fn test_sensor_states_join_estimate() {
        let mut sensor = TestSensor::new("z", &["x/0", "bias/0"], 0.04);
        sensor.sensor_state = Some(Box::new(TestState {
            name: "bias".to_string(),
            x: Vector::from_element(1, 0.0),
            f: Mat::from_element(1, 1, 1.0),
            q: Mat::from_element(1, 1, 0.0),
            nan_on_predict: false,
        }));
        let estimator = StateEstimator::new(
            Box::new(scalar_state(0.0, 0.01)),
            vec![Box::new(sensor) as Box<dyn Sensor>],
            &config(),
        )
        .unwrap();

        assert_eq!(estimator.state().size(), 2);
        assert_eq!(estimator.state().require_index("bias/0").unwrap(), 1);
        assert_eq!(estimator.covariance().shape(), (2, 2));
    }

    #[test]
    fn test_estimators_on_separate_threads() {
        let handles: Vec<_> = [1.0, -2.0]
            .into_iter()
            .map(|target| {
                let sensor = TestSensor::new("z", &["x/0"], 0.04);
                let mut estimator = StateEstimator::new(
                    Box::new(scalar_state(0.0, 0.01)),
                    vec![Box::new(sensor) as Box<dyn Sensor>],
                    &config(),
                )
                .unwrap();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        estimator.sensor_mut("z").unwrap().set_measurement(&[target]).unwrap();
                        estimator.compute().unwrap();
                    }
                    (target, estimator.element("x/0").unwrap())
                })
            })
            .collect();

        for handle in handles {
            let (target, estimate) = handle.join().unwrap();
            assert!((estimate - target).abs() < 1e-6);
        }
    }

    #[test]
    fn test_tick_timer() {
        let mut timer = TickTimer::new();
        assert_eq!(timer.stop_measurement(), Duration::ZERO);
        assert_eq!(timer.count(), 0);
        assert_eq!(timer.mean(), Duration::ZERO);

        timer.start_measurement();
        let elapsed = timer.stop_measurement();
        assert_eq!(timer.count(), 1);
        assert_eq!(timer.last(), elapsed);
        assert_eq!(timer.max(), elapsed);
        assert_eq!(timer.mean(), elapsed);
    }
}
