//! Batches of independent alignment problems.

use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};

use crate::point_set::{PointSet, WeightStats};

/// One source/target pair and its initial guess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchElement {
    pub source: PointSet,
    pub target: PointSet,
    pub initial_guess: Matrix4<f64>,
}

impl BatchElement {
    pub fn new(source: PointSet, target: PointSet, initial_guess: Matrix4<f64>) -> Self {
        Self {
            source,
            target,
            initial_guess,
        }
    }
}

/// Ordered batch of elements. Elements may have different point counts and
/// are aligned independently.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    elements: Vec<BatchElement>,
}

impl Batch {
    pub fn new(elements: Vec<BatchElement>) -> Self {
        Self { elements }
    }

    pub fn push(&mut self, element: BatchElement) {
        self.elements.push(element);
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn elements(&self) -> &[BatchElement] {
        &self.elements
    }

    pub fn iter(&self) -> impl Iterator<Item = &BatchElement> {
        self.elements.iter()
    }

    /// Source weight statistics per element.
    pub fn weight_stats(&self) -> Vec<WeightStats> {
        self.elements
            .iter()
            .map(|e| e.source.weight_stats())
            .collect()
    }
}

impl FromIterator<BatchElement> for Batch {
    fn from_iter<I: IntoIterator<Item = BatchElement>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_collects_elements() {
        let cloud = PointSet::from_xy(&[[0.0, 0.0], [1.0, 0.0]]);
        let batch: Batch = (0..3)
            .map(|_| BatchElement::new(cloud.clone(), cloud.clone(), Matrix4::identity()))
            .collect();
        assert_eq!(batch.len(), 3);
        assert!(!batch.is_empty());
        assert_eq!(batch.weight_stats()[2].num_nonzero, 2);
    }

    #[test]
    fn test_empty_batch() {
        let batch = Batch::default();
        assert!(batch.is_empty());
        assert!(batch.weight_stats().is_empty());
    }
}
