// Centroid-based similarity grouping (k-means with k-means++ seeding).
//
// Determinism: the only randomness is the seeded initialization, so the same
// seed and the same matrix always produce the same labels.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::table::{ClusteredPlayerRow, ClusteredTable, CombinedTable};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClusteringError {
    #[error("cluster count must be greater than 0")]
    ZeroClusters,

    #[error("{rows} players cannot form {clusters} clusters")]
    TooFewRows { rows: usize, clusters: usize },

    #[error("feature row {row} has {found} values, expected {expected}")]
    RaggedMatrix {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("{labels} labels for {rows} players")]
    LabelCount { labels: usize, rows: usize },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KMeansParams {
    pub clusters: usize,
    pub seed: u64,
    pub max_iterations: usize,
    /// Convergence threshold on total squared centroid movement, relative to
    /// the mean per-feature variance of the data.
    pub tolerance: f64,
}

impl Default for KMeansParams {
    fn default() -> Self {
        Self {
            clusters: 10,
            seed: 42,
            max_iterations: 300,
            tolerance: 1e-4,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterFit {
    /// Group id per input row, in [0, clusters).
    pub labels: Vec<usize>,
    pub centroids: Vec<Vec<f64>>,
    /// Sum of squared distances from each point to its centroid.
    pub inertia: f64,
    pub iterations: usize,
    pub converged: bool,
}

impl ClusterFit {
    /// Number of rows assigned to each group.
    pub fn sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.centroids.len()];
        for &label in &self.labels {
            sizes[label] += 1;
        }
        sizes
    }
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

/// Index and squared distance of the nearest centroid. Ties go to the lower
/// index.
fn nearest(point: &[f64], centroids: &[Vec<f64>]) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (i, centroid) in centroids.iter().enumerate() {
        let d = squared_distance(point, centroid);
        if d < best.1 {
            best = (i, d);
        }
    }
    best
}

/// Mean per-feature variance, used to make the tolerance scale-free.
fn mean_variance(points: &[Vec<f64>], dims: usize) -> f64 {
    if dims == 0 {
        return 0.0;
    }
    let n = points.len() as f64;
    let total: f64 = (0..dims)
        .map(|d| {
            let mean = points.iter().map(|p| p[d]).sum::<f64>() / n;
            points.iter().map(|p| (p[d] - mean).powi(2)).sum::<f64>() / n
        })
        .sum();
    total / dims as f64
}

/// k-means++ seeding: the first centroid is uniform, each following one is
/// drawn with probability proportional to its squared distance from the
/// nearest centroid chosen so far.
fn init_centroids(points: &[Vec<f64>], k: usize, rng: &mut StdRng) -> Vec<Vec<f64>> {
    let mut centroids = Vec::with_capacity(k);
    centroids.push(points[rng.gen_range(0..points.len())].clone());

    let mut closest: Vec<f64> = points
        .iter()
        .map(|p| squared_distance(p, &centroids[0]))
        .collect();

    while centroids.len() < k {
        // All-zero weights (every point coincides with a centroid) fall back
        // to a uniform draw.
        let next = match WeightedIndex::new(&closest) {
            Ok(dist) => dist.sample(rng),
            Err(_) => rng.gen_range(0..points.len()),
        };
        let centroid = points[next].clone();
        for (d, p) in closest.iter_mut().zip(points) {
            *d = d.min(squared_distance(p, &centroid));
        }
        centroids.push(centroid);
    }
    centroids
}

fn assign(points: &[Vec<f64>], centroids: &[Vec<f64>]) -> (Vec<usize>, Vec<f64>) {
    points.iter().map(|p| nearest(p, centroids)).unzip()
}

/// Recompute centroids as the mean of their assigned points. A cluster that
/// lost all its points is moved onto the point farthest from its current
/// centroid.
fn update_centroids(
    points: &[Vec<f64>],
    labels: &[usize],
    distances: &[f64],
    k: usize,
    dims: usize,
) -> Vec<Vec<f64>> {
    let mut sums = vec![vec![0.0; dims]; k];
    let mut counts = vec![0usize; k];
    for (point, &label) in points.iter().zip(labels) {
        counts[label] += 1;
        for (s, v) in sums[label].iter_mut().zip(point) {
            *s += v;
        }
    }

    let mut far_first: Vec<usize> = (0..points.len()).collect();
    far_first.sort_by(|&a, &b| distances[b].total_cmp(&distances[a]).then(a.cmp(&b)));
    let mut donors = far_first.into_iter();

    for (cluster, (sum, &count)) in sums.iter_mut().zip(&counts).enumerate() {
        if count > 0 {
            for s in sum.iter_mut() {
                *s /= count as f64;
            }
        } else if let Some(donor) = donors.next() {
            debug!("cluster {} empty; relocating to point {}", cluster, donor);
            *sum = points[donor].clone();
        }
    }
    sums
}

/// Partition `points` into `params.clusters` groups.
///
/// Runs Lloyd iterations from a seeded k-means++ start until the total
/// squared centroid shift falls to the tolerance or the iteration cap is hit,
/// then labels every point by its nearest final centroid.
pub fn kmeans(points: &[Vec<f64>], params: &KMeansParams) -> Result<ClusterFit, ClusteringError> {
    let k = params.clusters;
    if k == 0 {
        return Err(ClusteringError::ZeroClusters);
    }
    if points.len() < k {
        return Err(ClusteringError::TooFewRows {
            rows: points.len(),
            clusters: k,
        });
    }
    let dims = points[0].len();
    if let Some((row, p)) = points.iter().enumerate().find(|(_, p)| p.len() != dims) {
        return Err(ClusteringError::RaggedMatrix {
            row,
            expected: dims,
            found: p.len(),
        });
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut centroids = init_centroids(points, k, &mut rng);
    let threshold = params.tolerance * mean_variance(points, dims);

    let mut iterations = 0;
    let mut converged = false;
    while iterations < params.max_iterations {
        iterations += 1;
        let (labels, distances) = assign(points, &centroids);
        let updated = update_centroids(points, &labels, &distances, k, dims);
        let shift: f64 = centroids
            .iter()
            .zip(&updated)
            .map(|(old, new)| squared_distance(old, new))
            .sum();
        centroids = updated;
        if shift <= threshold {
            converged = true;
            break;
        }
    }

    let (labels, distances) = assign(points, &centroids);
    let inertia = distances.iter().sum();

    if converged {
        info!(
            "k-means converged after {} iterations (k={}, inertia {:.4})",
            iterations, k, inertia
        );
    } else {
        warn!(
            "k-means hit the {}-iteration cap without converging (k={}, inertia {:.4})",
            params.max_iterations, k, inertia
        );
    }

    Ok(ClusterFit {
        labels,
        centroids,
        inertia,
        iterations,
        converged,
    })
}

/// Attach one group id per row, in table order.
pub fn assign_clusters(
    table: CombinedTable,
    labels: &[usize],
) -> Result<ClusteredTable, ClusteringError> {
    if labels.len() != table.rows.len() {
        return Err(ClusteringError::LabelCount {
            labels: labels.len(),
            rows: table.rows.len(),
        });
    }
    let rows = table
        .rows
        .into_iter()
        .zip(labels)
        .map(|(row, &cluster)| ClusteredPlayerRow { row, cluster })
        .collect();
    Ok(ClusteredTable {
        seasons: table.seasons,
        metrics: table.metrics,
        rows,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
