//! 2D projection of embedding vectors for the dimensionality reducer.

use crate::collaborator::CollaboratorError;
use async_trait::async_trait;

const POWER_ITERATIONS: usize = 200;
const CONVERGENCE: f64 = 1e-10;
const ZERO_NORM: f64 = 1e-12;

/// Projects equal-length vectors to `(x, y)` points, one per input, in input order.
#[async_trait]
pub trait Projector: Send + Sync {
    /// Project `vectors` to the plane.
    async fn project(&self, vectors: Vec<Vec<f64>>) -> Result<Vec<(f64, f64)>, CollaboratorError>;
}

/// Principal component analysis onto the two directions of largest variance.
///
/// Components are found by power iteration from a fixed starting vector, so identical input
/// always yields identical output.
#[derive(Debug, Default, Clone, Copy)]
pub struct PcaProjector;

#[async_trait]
impl Projector for PcaProjector {
    async fn project(&self, vectors: Vec<Vec<f64>>) -> Result<Vec<(f64, f64)>, CollaboratorError> {
        let Some(dimension) = vectors.first().map(Vec::len) else {
            return Ok(Vec::new());
        };
        if vectors.iter().any(|vector| vector.len() != dimension) {
            return Err(CollaboratorError::Failed(
                "cannot project vectors of different dimensions".into(),
            ));
        }

        let centered = center(vectors, dimension);
        let first = principal_component(&centered, dimension, None);
        let second = principal_component(&centered, dimension, Some(&first));

        Ok(centered
            .iter()
            .map(|row| (dot(row, &first), dot(row, &second)))
            .collect())
    }
}

fn center(mut vectors: Vec<Vec<f64>>, dimension: usize) -> Vec<Vec<f64>> {
    let count = vectors.len() as f64;
    let mut mean = vec![0.0; dimension];
    for vector in &vectors {
        for (slot, value) in mean.iter_mut().zip(vector) {
            *slot += value / count;
        }
    }
    for vector in &mut vectors {
        for (value, offset) in vector.iter_mut().zip(&mean) {
            *value -= offset;
        }
    }
    vectors
}

/// Leading eigenvector of `XᵀX`, orthogonal to `exclude` when given. Zero when the data has no
/// variance in the remaining directions.
fn principal_component(rows: &[Vec<f64>], dimension: usize, exclude: Option<&[f64]>) -> Vec<f64> {
    let mut component: Vec<f64> = (0..dimension).map(|index| 1.0 / (index + 1) as f64).collect();
    if let Some(exclude) = exclude {
        orthogonalize(&mut component, exclude);
    }
    if !normalize(&mut component) {
        return vec![0.0; dimension];
    }

    for _ in 0..POWER_ITERATIONS {
        let mut next = vec![0.0; dimension];
        for row in rows {
            let weight = dot(row, &component);
            for (slot, value) in next.iter_mut().zip(row) {
                *slot += weight * value;
            }
        }
        if let Some(exclude) = exclude {
            orthogonalize(&mut next, exclude);
        }
        if !normalize(&mut next) {
            return vec![0.0; dimension];
        }

        let delta: f64 = next
            .iter()
            .zip(&component)
            .map(|(a, b)| (a - b).powi(2))
            .sum();
        component = next;
        if delta < CONVERGENCE {
            break;
        }
    }

    // Fix the sign so the largest component is positive.
    let pivot = component
        .iter()
        .copied()
        .fold(0.0_f64, |best, value| if value.abs() > best.abs() { value } else { best });
    if pivot < 0.0 {
        component.iter_mut().for_each(|value| *value = -*value);
    }
    component
}

fn orthogonalize(vector: &mut [f64], against: &[f64]) {
    let projection = dot(vector, against);
    for (value, basis) in vector.iter_mut().zip(against) {
        *value -= projection * basis;
    }
}

fn normalize(vector: &mut [f64]) -> bool {
    let norm = dot(vector, vector).sqrt();
    if norm < ZERO_NORM {
        return false;
    }
    vector.iter_mut().for_each(|value| *value /= norm);
    true
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
