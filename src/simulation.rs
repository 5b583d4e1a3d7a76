//! Simulated arm with noisy encoders and a biased gyro, used to exercise the
//! estimator end to end.

use std::f64::consts::PI;

use chrono::Utc;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::config::EstimatorConfig;
use crate::error::{EkfError, EkfResult};
use crate::filters::estimator::{EstimatorStats, StateEstimator, TickOutcome};
use crate::filters::sensor::Sensor;
use crate::sensors::{AngularVelocitySensor, JointPositionSensor};
use crate::states::{position_element, velocity_element, RobotState};

/// Name of the gyro sensor created by [`SimulationSensorReader::create_sensors`].
pub const IMU_NAME: &str = "imu";

// ===== Random numbers =====

/// xorshift64 generator. Deterministic for a given seed; a zero seed is
/// mapped to 1.
#[derive(Debug, Clone)]
pub struct Xorshift64 {
    state: u64,
}

impl Xorshift64 {
    pub fn new(seed: u64) -> Self {
        let state = if seed == 0 { 1 } else { seed };
        Self { state }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Uniform in [0, 1).
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    pub fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.next_f64()
    }

    /// Uniform in `0..n`; 0 when `n == 0`.
    pub fn below(&mut self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        (self.next_u64() % n as u64) as usize
    }

    /// Standard normal sample (Box-Muller).
    pub fn gaussian(&mut self) -> f64 {
        let u1 = 1.0 - self.next_f64();
        let u2 = self.next_f64();
        (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
    }
}

// ===== Ground truth =====

#[derive(Debug, Clone)]
pub struct ArmJoint {
    pub name: String,
    amplitude: f64,
    /// [rad/s]
    angular_frequency: f64,
    phase: f64,
    pub q: f64,
    pub qd: f64,
}

impl ArmJoint {
    fn update(&mut self, time: f64) {
        let angle = self.angular_frequency * time + self.phase;
        self.q = self.amplitude * angle.sin();
        self.qd = self.amplitude * self.angular_frequency * angle.cos();
    }
}

/// Planar serial arm whose revolute joints all spin about `z`. Each joint
/// follows its own sinusoid; the gyro sits on the last link.
#[derive(Debug, Clone)]
pub struct SimpleArm {
    joints: Vec<ArmJoint>,
    time: f64,
}

impl SimpleArm {
    pub fn new(joint_count: usize) -> Self {
        let mut joints: Vec<ArmJoint> = (0..joint_count)
            .map(|i| ArmJoint {
                name: format!("joint_{}", i + 1),
                amplitude: 0.8 / (i + 1) as f64,
                angular_frequency: 2.0 * PI * (0.3 + 0.2 * i as f64),
                phase: 0.7 * i as f64,
                q: 0.0,
                qd: 0.0,
            })
            .collect();
        for joint in &mut joints {
            joint.update(0.0);
        }
        Self { joints, time: 0.0 }
    }

    pub fn joints(&self) -> &[ArmJoint] {
        &self.joints
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn step(&mut self, dt: f64) {
        self.time += dt;
        for joint in &mut self.joints {
            joint.update(self.time);
        }
    }

    /// Angular velocity of the last link in its own frame.
    pub fn body_angular_velocity(&self) -> Vector3<f64> {
        Vector3::new(0.0, 0.0, self.joints.iter().map(|joint| joint.qd).sum())
    }
}

// ===== Sensors =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationOptions {
    pub ticks: usize,
    pub joints: usize,
    pub seed: u64,
    /// [rad]
    pub encoder_noise_std: f64,
    /// [rad/s]
    pub gyro_noise_std: f64,
    /// [rad/s]
    pub gyro_bias: [f64; 3],
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            ticks: 4000,
            joints: 3,
            seed: 42,
            encoder_noise_std: 1e-3,
            gyro_noise_std: 1e-2,
            gyro_bias: [0.01, -0.01, 0.02],
        }
    }
}

/// Turns ground truth into sensor readings and hands them to the estimator.
pub struct SimulationSensorReader {
    imu_name: String,
    encoder_noise_std: f64,
    gyro_noise_std: f64,
    gyro_bias: Vector3<f64>,
    rng: Xorshift64,
    encoder_readings: Vec<f64>,
}

impl SimulationSensorReader {
    pub fn new(imu_name: &str, options: &SimulationOptions) -> Self {
        Self {
            imu_name: imu_name.to_string(),
            encoder_noise_std: options.encoder_noise_std,
            gyro_noise_std: options.gyro_noise_std,
            gyro_bias: Vector3::from(options.gyro_bias),
            rng: Xorshift64::new(options.seed),
            encoder_readings: Vec::new(),
        }
    }

    /// One encoder per joint, named after the joint, plus a gyro called
    /// [`IMU_NAME`] on the last link.
    pub fn create_sensors(arm: &SimpleArm, config: &EstimatorConfig) -> EkfResult<Vec<Box<dyn Sensor>>> {
        let mut sensors: Vec<Box<dyn Sensor>> = Vec::new();
        let mut gyro = AngularVelocitySensor::new(
            IMU_NAME,
            config.dt,
            config.angular_velocity_variance,
            config.gyro_bias_variance,
        )?;

        for joint in arm.joints() {
            log::debug!("Creating encoder for '{}'", joint.name);
            sensors.push(Box::new(JointPositionSensor::new(
                &joint.name,
                config.dt,
                config.joint_position_variance,
            )?));
            gyro.add_joint(&joint.name, Vector3::z());
        }
        sensors.push(Box::new(gyro));
        Ok(sensors)
    }

    /// Writes one reading into every sensor.
    pub fn read(&mut self, arm: &SimpleArm, estimator: &mut StateEstimator) -> EkfResult<()> {
        self.encoder_readings.clear();
        for joint in arm.joints() {
            let q = joint.q + self.encoder_noise_std * self.rng.gaussian();
            estimator.sensor_mut(&joint.name)?.set_measurement(&[q])?;
            self.encoder_readings.push(q);
        }

        let noise = Vector3::new(self.rng.gaussian(), self.rng.gaussian(), self.rng.gaussian());
        let omega = arm.body_angular_velocity() + self.gyro_bias + noise * self.gyro_noise_std;
        estimator.sensor_mut(&self.imu_name)?.set_measurement(omega.as_slice())
    }

    /// Encoder values of the last [`read`](Self::read), in joint order.
    pub fn encoder_readings(&self) -> &[f64] {
        &self.encoder_readings
    }
}

// ===== Closed loop =====

pub fn build_estimator(arm: &SimpleArm, config: &EstimatorConfig) -> EkfResult<StateEstimator> {
    let mut robot = RobotState::new("arm", config.dt, config.joint_acceleration_variance)?;
    for joint in arm.joints() {
        robot.add_joint(&joint.name)?;
    }
    let sensors = SimulationSensorReader::create_sensors(arm, config)?;
    StateEstimator::new(Box::new(robot), sensors, config)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JointReport {
    pub name: String,
    pub true_position: f64,
    pub estimated_position: f64,
    pub true_velocity: f64,
    pub estimated_velocity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationReport {
    pub started_at: String,
    pub config: EstimatorConfig,
    pub options: SimulationOptions,
    /// RMS encoder error over the second half of the run [rad]
    pub raw_rms_error: f64,
    /// RMS estimate error over the second half of the run [rad]
    pub filtered_rms_error: f64,
    pub gyro_bias_estimate: [f64; 3],
    pub joints: Vec<JointReport>,
    pub stats: EstimatorStats,
}

/// Runs the arm, the sensor reader and the estimator for `options.ticks`
/// ticks of `config.dt`. Errors are only collected after the first half to
/// skip the initial transient.
pub fn run_simulation(config: &EstimatorConfig, options: &SimulationOptions) -> EkfResult<SimulationReport> {
    if options.joints == 0 {
        return Err(EkfError::InvalidArgument("the arm needs at least one joint".to_string()));
    }
    let started_at = Utc::now();

    let mut arm = SimpleArm::new(options.joints);
    let mut estimator = build_estimator(&arm, config)?;
    let mut reader = SimulationSensorReader::new(IMU_NAME, options);
    let position_elements: Vec<String> = arm.joints().iter().map(|j| position_element(&j.name)).collect();

    let settle = options.ticks / 2;
    let mut raw_sq = 0.0;
    let mut filtered_sq = 0.0;
    let mut samples = 0usize;

    for tick in 0..options.ticks {
        arm.step(config.dt);
        reader.read(&arm, &mut estimator)?;
        if estimator.compute()? == TickOutcome::IntegrateOnly {
            log::debug!("Tick {} integrated only", tick);
        }

        if tick < settle {
            continue;
        }
        for ((joint, element), raw) in arm
            .joints()
            .iter()
            .zip(&position_elements)
            .zip(reader.encoder_readings())
        {
            let estimate = estimator.element(element)?;
            raw_sq += (raw - joint.q).powi(2);
            filtered_sq += (estimate - joint.q).powi(2);
            samples += 1;
        }
    }

    let samples = samples.max(1) as f64;
    let mut gyro_bias_estimate = [0.0; 3];
    for (axis, value) in gyro_bias_estimate.iter_mut().enumerate() {
        *value = estimator.element(&format!("{IMU_NAME}_bias/{axis}"))?;
    }

    let joints = arm
        .joints()
        .iter()
        .map(|joint| {
            Ok(JointReport {
                name: joint.name.clone(),
                true_position: joint.q,
                estimated_position: estimator.element(&position_element(&joint.name))?,
                true_velocity: joint.qd,
                estimated_velocity: estimator.element(&velocity_element(&joint.name))?,
            })
        })
        .collect::<EkfResult<Vec<_>>>()?;

    let report = SimulationReport {
        started_at: started_at.to_rfc3339(),
        config: config.clone(),
        options: options.clone(),
        raw_rms_error: (raw_sq / samples).sqrt(),
        filtered_rms_error: (filtered_sq / samples).sqrt(),
        gyro_bias_estimate,
        joints,
        stats: estimator.stats(),
    };
    log::info!(
        "Simulated {:.2} s: raw RMS {:.5} rad, filtered RMS {:.5} rad",
        arm.time(),
        report.raw_rms_error,
        report.filtered_rms_error
    );
    Ok(report)
}
