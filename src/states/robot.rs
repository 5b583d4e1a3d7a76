use crate::error::{check_size, EkfError, EkfResult};
use crate::filters::state::State;
use crate::types::{MatViewMut, Vector, VectorView, VectorViewMut};

/// Element name of a joint position, e.g. `"elbow/q"`.
pub fn position_element(joint: &str) -> String {
    format!("{joint}/q")
}

/// Element name of a joint velocity, e.g. `"elbow/qd"`.
pub fn velocity_element(joint: &str) -> String {
    format!("{joint}/qd")
}

/// Generalized coordinates of a robot with 1-DoF joints.
///
/// State vector layout: `[q_1 .. q_k, qd_1 .. qd_k]`. The process model is
/// constant velocity, `q += qd * dt`. `Q` is diagonal: `¼dt⁴σ²` on positions
/// and `dt²σ²` on velocities, without the `½dt³σ²` position/velocity
/// coupling of a full white-acceleration model.
#[derive(Debug, Clone)]
pub struct RobotState {
    name: String,
    /// Time step [seconds]
    dt: f64,
    /// Joint acceleration noise [rad²/s⁴]
    acceleration_variance: f64,
    joint_names: Vec<String>,
    x: Vector,
}

impl RobotState {
    pub fn new(name: impl Into<String>, dt: f64, acceleration_variance: f64) -> EkfResult<Self> {
        if !(dt > 0.0) {
            return Err(EkfError::InvalidArgument(format!("dt must be positive, got {dt}")));
        }
        Ok(Self {
            name: name.into(),
            dt,
            acceleration_variance,
            joint_names: Vec::new(),
            x: Vector::zeros(0),
        })
    }

    pub fn with_joints(
        name: impl Into<String>,
        joints: &[&str],
        dt: f64,
        acceleration_variance: f64,
    ) -> EkfResult<Self> {
        let mut state = Self::new(name, dt, acceleration_variance)?;
        for joint in joints {
            state.add_joint(joint)?;
        }
        Ok(state)
    }

    /// Adds a joint at rest at zero. Joints must be added before the state is
    /// handed to a composite.
    pub fn add_joint(&mut self, joint: &str) -> EkfResult<()> {
        if self.joint_names.iter().any(|name| name == joint) {
            return Err(EkfError::InvalidArgument(format!(
                "joint '{joint}' already exists in '{}'",
                self.name
            )));
        }

        let k = self.joint_names.len();
        let mut x = Vector::zeros(2 * (k + 1));
        x.rows_mut(0, k).copy_from(&self.x.rows(0, k));
        x.rows_mut(k + 1, k).copy_from(&self.x.rows(k, k));
        self.x = x;
        self.joint_names.push(joint.to_string());
        Ok(())
    }

    pub fn joint_count(&self) -> usize {
        self.joint_names.len()
    }

    pub fn joint_names(&self) -> &[String] {
        &self.joint_names
    }

    pub fn find_joint_position_index(&self, joint: &str) -> Option<usize> {
        self.joint_names.iter().position(|name| name == joint)
    }

    pub fn find_joint_velocity_index(&self, joint: &str) -> Option<usize> {
        self.find_joint_position_index(joint)
            .map(|index| index + self.joint_count())
    }

    pub fn joint_position(&self, joint: &str) -> Option<f64> {
        self.find_joint_position_index(joint).map(|index| self.x[index])
    }

    pub fn joint_velocity(&self, joint: &str) -> Option<f64> {
        self.find_joint_velocity_index(joint).map(|index| self.x[index])
    }

    /// Seeds a joint's position and velocity.
    pub fn set_joint(&mut self, joint: &str, q: f64, qd: f64) -> EkfResult<()> {
        let index = self.find_joint_position_index(joint).ok_or_else(|| {
            EkfError::NotFound(format!("no joint '{joint}' in '{}'", self.name))
        })?;
        let k = self.joint_count();
        self.x[index] = q;
        self.x[index + k] = qd;
        Ok(())
    }
}

impl State for RobotState {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> usize {
        self.x.nrows()
    }

    fn predict(&mut self) {
        let k = self.joint_count();
        for i in 0..k {
            self.x[i] += self.x[k + i] * self.dt;
        }
    }

    fn fill_state_vector(&self, mut out: VectorViewMut<'_>) {
        out.copy_from(&self.x);
    }

    fn assign_state_vector(&mut self, x: VectorView<'_>) -> EkfResult<()> {
        check_size(&self.name, x.nrows(), self.size())?;
        self.x.copy_from(&x);
        Ok(())
    }

    fn fill_f_matrix(&self, mut out: MatViewMut<'_>) {
        let k = self.joint_count();
        out.fill_with_identity();
        for i in 0..k {
            out[(i, k + i)] = self.dt;
        }
    }

    fn fill_q_matrix(&self, mut out: MatViewMut<'_>) {
        let k = self.joint_count();
        let q_pos = 0.25 * self.dt.powi(4) * self.acceleration_variance;
        let q_vel = self.dt.powi(2) * self.acceleration_variance;
        out.fill(0.0);
        for i in 0..k {
            out[(i, i)] = q_pos;
            out[(k + i, k + i)] = q_vel;
        }
    }

    fn element(&self, index: usize) -> Option<f64> {
        self.x.get(index).copied()
    }

    fn find_index(&self, element: &str) -> Option<usize> {
        if let Some(joint) = element.strip_suffix("/qd") {
            return self.find_joint_velocity_index(joint);
        }
        element
            .strip_suffix("/q")
            .and_then(|joint| self.find_joint_position_index(joint))
    }
}
