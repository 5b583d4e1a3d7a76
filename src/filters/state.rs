//! Estimated state units and their block-diagonal composition.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{check_size, EkfError, EkfResult};
use crate::types::{
    full_view_mut, reshape, reshape_vector, vector_view, vector_view_mut, Mat, MatViewMut, Vector,
    VectorView, VectorViewMut,
};

static NEXT_COMPOSITE_ID: AtomicU64 = AtomicU64::new(1);

/// A unit of estimated state with a linear(ized) time-evolution model.
///
/// Implementors write into views that already have the exact shape of their
/// block; the provided `state_vector`/`f_matrix`/`q_matrix` methods reshape an
/// owned buffer first and then delegate.
pub trait State: Send {
    fn name(&self) -> &str;

    /// Number of elements, fixed after construction.
    fn size(&self) -> usize;

    /// Advances the state in place using its own process model.
    fn predict(&mut self);

    /// Writes the state vector into `out` (`size` rows).
    fn fill_state_vector(&self, out: VectorViewMut<'_>);

    /// Overwrites the state vector. Fails with [`EkfError::InvalidArgument`]
    /// unless `x` has exactly `size` rows.
    fn assign_state_vector(&mut self, x: VectorView<'_>) -> EkfResult<()>;

    /// Writes the linearized transition matrix into `out` (`size×size`).
    fn fill_f_matrix(&self, out: MatViewMut<'_>);

    /// Writes the process noise covariance into `out` (`size×size`).
    fn fill_q_matrix(&self, out: MatViewMut<'_>);

    /// Current value of the element at `index`, `None` past the end.
    fn element(&self, index: usize) -> Option<f64>;

    /// Index of a named element, e.g. `"elbow/q"`.
    fn find_index(&self, _element: &str) -> Option<usize> {
        None
    }

    /// Offset of a registered child inside this state. Only composites have children.
    fn locate(&self, _handle: StateHandle) -> Option<usize> {
        None
    }

    fn state_vector(&self, out: &mut Vector) {
        reshape_vector(out, self.size());
        self.fill_state_vector(vector_view_mut(out));
    }

    fn set_state_vector(&mut self, x: &Vector) -> EkfResult<()> {
        self.assign_state_vector(vector_view(x))
    }

    fn f_matrix(&self, out: &mut Mat) {
        reshape(out, self.size(), self.size());
        self.fill_f_matrix(full_view_mut(out));
    }

    fn q_matrix(&self, out: &mut Mat) {
        reshape(out, self.size(), self.size());
        self.fill_q_matrix(full_view_mut(out));
    }
}

/// Identifies a child registered with a [`ComposedState`].
///
/// Handles stay valid when the composite is itself added to another
/// composite, so the outer one can resolve the child's absolute offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateHandle {
    owner: u64,
    slot: usize,
}

/// Direct sum of an ordered set of [`State`]s.
///
/// # Overview
/// ```text
///      ├──────────  x  ─────────┤
///       ├──a──┤ ├──b──┤ ├──c──┤
/// ┬   ╭────────────────────────╮
/// │ ┬ │                        │
/// │ a │   Fa       0       0   │
/// │ ┴ │                        │
///   ┬ │                        │
/// F b │    0      Fb       0   │
///   ┴ │                        │
/// │ ┬ │                        │
/// │ c │    0       0      Fc   │
/// │ ┴ │                        │
/// ┴   ╰────────────────────────╯
/// ```
/// Each child's block starts at the sum of the sizes of the children added
/// before it. The same layout holds for `Q` and the state vector.
pub struct ComposedState {
    id: u64,
    name: String,
    states: Vec<Box<dyn State>>,
    start_indices: Vec<usize>,
    size: usize,
}

impl ComposedState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: NEXT_COMPOSITE_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            states: Vec::new(),
            start_indices: Vec::new(),
            size: 0,
        }
    }

    /// Appends `state` after all existing children.
    pub fn add_state(&mut self, state: Box<dyn State>) -> StateHandle {
        let handle = StateHandle {
            owner: self.id,
            slot: self.states.len(),
        };
        self.states.push(state);
        self.recompute_start_indices();
        handle
    }

    fn recompute_start_indices(&mut self) {
        self.start_indices.clear();
        let mut start = 0;
        for state in &self.states {
            self.start_indices.push(start);
            start += state.size();
        }
        self.size = start;
    }

    /// Offset of `handle` in this state, searching nested composites as well.
    pub fn start_index(&self, handle: StateHandle) -> EkfResult<usize> {
        self.locate(handle).ok_or_else(|| {
            EkfError::NotFound(format!("state {handle:?} is not part of '{}'", self.name))
        })
    }

    /// Offset of the first direct child called `name`.
    pub fn start_index_by_name(&self, name: &str) -> EkfResult<usize> {
        self.children()
            .find(|(_, state)| state.name() == name)
            .map(|(start, _)| start)
            .ok_or_else(|| EkfError::NotFound(format!("no state '{name}' in '{}'", self.name)))
    }

    /// Index of a named element, or a configuration error naming the element.
    pub fn require_index(&self, element: &str) -> EkfResult<usize> {
        self.find_index(element).ok_or_else(|| {
            EkfError::Configuration(format!("'{}' has no element '{element}'", self.name))
        })
    }

    /// Index and current value of a named element.
    pub fn require_element(&self, element: &str) -> EkfResult<(usize, f64)> {
        let index = self.require_index(element)?;
        let value = self.element(index).ok_or_else(|| {
            EkfError::Configuration(format!(
                "element '{element}' resolved to index {index} outside '{}'",
                self.name
            ))
        })?;
        Ok((index, value))
    }

    /// Direct children with their start index, in insertion order.
    pub fn children(&self) -> impl Iterator<Item = (usize, &(dyn State + 'static))> + '_ {
        self.start_indices
            .iter()
            .copied()
            .zip(self.states.iter().map(|state| state.as_ref()))
    }

    /// Number of direct children.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

impl State for ComposedState {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> usize {
        self.size
    }

    fn predict(&mut self) {
        for state in &mut self.states {
            state.predict();
        }
    }

    fn fill_state_vector(&self, mut out: VectorViewMut<'_>) {
        for (start, state) in self.start_indices.iter().zip(&self.states) {
            state.fill_state_vector(out.rows_mut(*start, state.size()));
        }
    }

    fn assign_state_vector(&mut self, x: VectorView<'_>) -> EkfResult<()> {
        check_size(&self.name, x.nrows(), self.size)?;
        for (start, state) in self.start_indices.iter().zip(&mut self.states) {
            let size = state.size();
            state.assign_state_vector(x.rows(*start, size))?;
        }
        Ok(())
    }

    fn fill_f_matrix(&self, mut out: MatViewMut<'_>) {
        out.fill(0.0);
        for (start, state) in self.start_indices.iter().zip(&self.states) {
            let size = state.size();
            state.fill_f_matrix(out.view_mut((*start, *start), (size, size)));
        }
    }

    fn fill_q_matrix(&self, mut out: MatViewMut<'_>) {
        out.fill(0.0);
        for (start, state) in self.start_indices.iter().zip(&self.states) {
            let size = state.size();
            state.fill_q_matrix(out.view_mut((*start, *start), (size, size)));
        }
    }

    fn element(&self, index: usize) -> Option<f64> {
        self.children()
            .find(|(start, state)| index < start + state.size())
            .and_then(|(start, state)| state.element(index - start))
    }

    fn find_index(&self, element: &str) -> Option<usize> {
        self.children()
            .find_map(|(start, state)| state.find_index(element).map(|index| start + index))
    }

    fn locate(&self, handle: StateHandle) -> Option<usize> {
        if handle.owner == self.id {
            return self.start_indices.get(handle.slot).copied();
        }
        self.children()
            .find_map(|(start, state)| state.locate(handle).map(|index| start + index))
    }
}
