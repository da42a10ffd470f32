//! Concentration state of one simulated trajectory.

use std::collections::BTreeMap;

use crate::schema::Label;

/// Concentrations of the simulated nodes at the current time.
///
/// Slots follow the order of the simulator the state was created from.
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryState {
    labels: Vec<Label>,
    index: BTreeMap<Label, usize>,
    concentrations: Vec<f64>,
    output_labels: Vec<Label>,
    time: f64,
}

impl TrajectoryState {
    /// Create a state at time zero.
    pub fn new(labels: Vec<Label>, concentrations: Vec<f64>, output_labels: Vec<Label>) -> Self {
        debug_assert_eq!(labels.len(), concentrations.len());
        let index = labels.iter().enumerate().map(|(i, &l)| (l, i)).collect();
        Self {
            labels,
            index,
            concentrations,
            output_labels,
            time: 0.0,
        }
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn set_time(&mut self, time: f64) {
        self.time = time;
    }

    /// Number of tracked species.
    pub fn len(&self) -> usize {
        self.concentrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.concentrations.is_empty()
    }

    /// Tracked labels in slot order.
    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// Tracked output labels.
    pub fn output_labels(&self) -> &[Label] {
        &self.output_labels
    }

    pub fn slot(&self, label: Label) -> Option<usize> {
        self.index.get(&label).copied()
    }

    pub fn concentration(&self, label: Label) -> Option<f64> {
        self.slot(label).map(|i| self.concentrations[i])
    }

    /// Overwrite a concentration. Returns false if the label is not tracked.
    pub fn set_concentration(&mut self, label: Label, concentration: f64) -> bool {
        match self.slot(label) {
            Some(i) => {
                self.concentrations[i] = concentration;
                true
            }
            None => false,
        }
    }

    pub fn concentrations(&self) -> &[f64] {
        &self.concentrations
    }

    pub fn concentrations_mut(&mut self) -> &mut [f64] {
        &mut self.concentrations
    }

    /// Output concentrations in `output_labels` order.
    pub fn outputs(&self) -> Vec<(Label, f64)> {
        self.output_labels
            .iter()
            .filter_map(|&l| self.concentration(l).map(|c| (l, c)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_label() {
        let mut state = TrajectoryState::new(vec![4, 1, 9], vec![0.5, 1.5, 2.5], vec![9]);
        assert_eq!(state.slot(1), Some(1));
        assert_eq!(state.concentration(9), Some(2.5));
        assert!(state.set_concentration(4, 3.0));
        assert!(!state.set_concentration(7, 3.0));
        assert_eq!(state.concentrations(), &[3.0, 1.5, 2.5]);
        assert_eq!(state.outputs(), vec![(9, 2.5)]);
    }
}
