use crate::error::{check_size, EkfResult};
use crate::filters::state::State;
use crate::types::{MatViewMut, Vector, VectorView, VectorViewMut};

/// Slowly drifting quantity such as a sensor bias.
///
/// `predict` leaves the value untouched; `F = I` and `Q = σ²·I`. Elements are
/// named `"<name>/<i>"`.
#[derive(Debug, Clone)]
pub struct RandomWalkState {
    name: String,
    variance: f64,
    x: Vector,
}

impl RandomWalkState {
    pub fn new(name: impl Into<String>, size: usize, variance: f64) -> Self {
        Self::with_initial(name, Vector::zeros(size), variance)
    }

    pub fn with_initial(name: impl Into<String>, x: Vector, variance: f64) -> Self {
        Self {
            name: name.into(),
            variance,
            x,
        }
    }

    pub fn element_name(&self, index: usize) -> String {
        format!("{}/{index}", self.name)
    }

    pub fn values(&self) -> &Vector {
        &self.x
    }
}

impl State for RandomWalkState {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> usize {
        self.x.nrows()
    }

    fn predict(&mut self) {}

    fn fill_state_vector(&self, mut out: VectorViewMut<'_>) {
        out.copy_from(&self.x);
    }

    fn assign_state_vector(&mut self, x: VectorView<'_>) -> EkfResult<()> {
        check_size(&self.name, x.nrows(), self.size())?;
        self.x.copy_from(&x);
        Ok(())
    }

    fn fill_f_matrix(&self, mut out: MatViewMut<'_>) {
        out.fill_with_identity();
    }

    fn fill_q_matrix(&self, mut out: MatViewMut<'_>) {
        out.fill_with_identity();
        out *= self.variance;
    }

    fn element(&self, index: usize) -> Option<f64> {
        self.x.get(index).copied()
    }

    fn find_index(&self, element: &str) -> Option<usize> {
        let index: usize = element
            .strip_prefix(self.name.as_str())?
            .strip_prefix('/')?
            .parse()
            .ok()?;
        (index < self.size()).then_some(index)
    }
}
