//! Isolation forest outlier model.
//!
//! An ensemble of randomized binary trees over the standardized feature
//! vector. Points isolated in few splits receive scores near 1; the
//! decision threshold is the empirical `(1 - contamination)` quantile of
//! the training scores.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

const N_TREES: usize = 100;
const MAX_TREE_SAMPLES: usize = 256;

/// Euler–Mascheroni constant, for the average BST path length.
const EULER_GAMMA: f64 = 0.577_215_664_901_532_9;

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Leaf {
        size: usize,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    /// Path length of `x` from the root, with the unsplit remainder
    /// estimated by the average BST depth of the leaf population.
    fn path_length(&self, x: &[f64]) -> f64 {
        let mut index = 0usize;
        let mut depth = 0.0;
        loop {
            match &self.nodes[index] {
                Node::Leaf { size } => return depth + average_path_length(*size),
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    index = if x[*feature] < *threshold { *left } else { *right };
                    depth += 1.0;
                }
            }
        }
    }
}

/// Average unsuccessful-search path length in a BST of `n` nodes.
fn average_path_length(n: usize) -> f64 {
    if n <= 1 {
        return 0.0;
    }
    let n = n as f64;
    2.0 * ((n - 1.0).ln() + EULER_GAMMA) - 2.0 * (n - 1.0) / n
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationForest {
    trees: Vec<Tree>,
    sample_size: usize,
    /// Per-feature standardization fitted on the training set.
    scaler_mean: Vec<f64>,
    scaler_std: Vec<f64>,
    /// Score at the (1 - contamination) training quantile.
    threshold: f64,
    contamination: f64,
}

/// Training summary persisted with the artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForestReport {
    pub train_samples: usize,
    pub threshold: f64,
    pub score_mean: f64,
    pub flagged_fraction: f64,
}

impl IsolationForest {
    /// Fit the forest. Fails on an empty training set or ragged rows.
    pub fn train(
        data: &[Vec<f64>],
        contamination: f64,
        seed: u64,
    ) -> Result<(Self, ForestReport), String> {
        if data.is_empty() {
            return Err("empty training set".to_string());
        }
        let dim = data[0].len();
        if dim == 0 || data.iter().any(|row| row.len() != dim) {
            return Err("inconsistent feature dimensions".to_string());
        }

        let (scaler_mean, scaler_std) = fit_scaler(data, dim);
        let scaled: Vec<Vec<f64>> = data
            .iter()
            .map(|row| standardize(row, &scaler_mean, &scaler_std))
            .collect();

        let sample_size = scaled.len().min(MAX_TREE_SAMPLES);
        let max_depth = (sample_size as f64).log2().ceil().max(1.0) as usize;
        let mut rng = StdRng::seed_from_u64(seed);

        let mut trees = Vec::with_capacity(N_TREES);
        for _ in 0..N_TREES {
            let mut indices: Vec<usize> = (0..sample_size)
                .map(|_| rng.gen_range(0..scaled.len()))
                .collect();
            let mut nodes = Vec::new();
            build_tree(&scaled, &mut indices, 0, max_depth, &mut rng, &mut nodes);
            trees.push(Tree { nodes });
        }

        let mut forest = Self {
            trees,
            sample_size,
            scaler_mean,
            scaler_std,
            threshold: 1.0,
            contamination,
        };

        let mut scores: Vec<f64> = data.iter().map(|row| forest.score(row)).collect();
        let score_mean = scores.iter().sum::<f64>() / scores.len() as f64;
        scores.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        forest.threshold = quantile(&scores, 1.0 - contamination);

        let flagged = data.iter().filter(|row| forest.is_outlier(row)).count();
        let report = ForestReport {
            train_samples: data.len(),
            threshold: forest.threshold,
            score_mean,
            flagged_fraction: flagged as f64 / data.len() as f64,
        };
        Ok((forest, report))
    }

    /// Anomaly score in [0, 1]; higher is more anomalous.
    pub fn score(&self, features: &[f64]) -> f64 {
        let x = standardize(features, &self.scaler_mean, &self.scaler_std);
        let avg_path = self
            .trees
            .iter()
            .map(|tree| tree.path_length(&x))
            .sum::<f64>()
            / self.trees.len() as f64;
        let normalizer = average_path_length(self.sample_size).max(f64::EPSILON);
        2f64.powf(-avg_path / normalizer).clamp(0.0, 1.0)
    }

    pub fn is_outlier(&self, features: &[f64]) -> bool {
        self.score(features) >= self.threshold
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn contamination(&self) -> f64 {
        self.contamination
    }
}

fn fit_scaler(data: &[Vec<f64>], dim: usize) -> (Vec<f64>, Vec<f64>) {
    let n = data.len() as f64;
    let mut mean = vec![0.0; dim];
    for row in data {
        for (m, v) in mean.iter_mut().zip(row) {
            *m += v / n;
        }
    }
    let mut std = vec![0.0; dim];
    for row in data {
        for ((s, v), m) in std.iter_mut().zip(row).zip(&mean) {
            *s += (v - m).powi(2) / n;
        }
    }
    for s in &mut std {
        *s = s.sqrt();
        if *s < f64::EPSILON {
            *s = 1.0;
        }
    }
    (mean, std)
}

fn standardize(row: &[f64], mean: &[f64], std: &[f64]) -> Vec<f64> {
    row.iter()
        .zip(mean)
        .zip(std)
        .map(|((v, m), s)| (v - m) / s)
        .collect()
}

/// Empirical quantile of an ascending-sorted slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

/// Recursive randomized splitting; returns the index of the built node.
fn build_tree(
    data: &[Vec<f64>],
    indices: &mut Vec<usize>,
    depth: usize,
    max_depth: usize,
    rng: &mut StdRng,
    nodes: &mut Vec<Node>,
) -> usize {
    if indices.len() <= 1 || depth >= max_depth {
        nodes.push(Node::Leaf {
            size: indices.len(),
        });
        return nodes.len() - 1;
    }

    let dim = data[0].len();
    let feature = rng.gen_range(0..dim);
    let (min, max) = indices.iter().fold((f64::MAX, f64::MIN), |(lo, hi), &i| {
        let v = data[i][feature];
        (lo.min(v), hi.max(v))
    });
    if (max - min).abs() < f64::EPSILON {
        nodes.push(Node::Leaf {
            size: indices.len(),
        });
        return nodes.len() - 1;
    }

    let threshold = rng.gen_range(min..max);
    let mut left: Vec<usize> = Vec::new();
    let mut right: Vec<usize> = Vec::new();
    for &i in indices.iter() {
        if data[i][feature] < threshold {
            left.push(i);
        } else {
            right.push(i);
        }
    }

    // Reserve this node's slot before recursing.
    nodes.push(Node::Leaf { size: 0 });
    let slot = nodes.len() - 1;
    let left_index = build_tree(data, &mut left, depth + 1, max_depth, rng, nodes);
    let right_index = build_tree(data, &mut right, depth + 1, max_depth, rng, nodes);
    nodes[slot] = Node::Split {
        feature,
        threshold,
        left: left_index,
        right: right_index,
    };
    slot
}
