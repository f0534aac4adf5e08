//! Sequence reconstruction model.
//!
//! A dense autoencoder over the flattened per-line sequence of
//! headway/delay/dwell aggregates (one step per feed tick). The encoder
//! narrows through hidden/2 to hidden/4 and mirrors back out; inputs are
//! z-normalized per feature column. Reconstruction error at or above the
//! 95th percentile of training error flags the sequence.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

const ADAM_LR: f64 = 0.001;
const ADAM_B1: f64 = 0.9;
const ADAM_B2: f64 = 0.999;
const ADAM_EPS: f64 = 1e-8;
const BATCH_SIZE: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DenseLayer {
    /// Row-major `out x in`.
    weights: Vec<Vec<f64>>,
    biases: Vec<f64>,
}

impl DenseLayer {
    fn xavier(input: usize, output: usize, rng: &mut StdRng) -> Self {
        let limit = (6.0 / (input + output) as f64).sqrt();
        Self {
            weights: (0..output)
                .map(|_| (0..input).map(|_| rng.gen_range(-limit..limit)).collect())
                .collect(),
            biases: vec![0.0; output],
        }
    }

    fn forward(&self, input: &[f64]) -> Vec<f64> {
        self.weights
            .iter()
            .zip(&self.biases)
            .map(|(row, b)| row.iter().zip(input).map(|(w, x)| w * x).sum::<f64>() + b)
            .collect()
    }
}

/// Adam accumulator mirroring one layer's parameter shapes.
#[derive(Clone)]
struct AdamState {
    m_w: Vec<Vec<f64>>,
    v_w: Vec<Vec<f64>>,
    m_b: Vec<f64>,
    v_b: Vec<f64>,
}

impl AdamState {
    fn zeros_like(layer: &DenseLayer) -> Self {
        Self {
            m_w: layer.weights.iter().map(|r| vec![0.0; r.len()]).collect(),
            v_w: layer.weights.iter().map(|r| vec![0.0; r.len()]).collect(),
            m_b: vec![0.0; layer.biases.len()],
            v_b: vec![0.0; layer.biases.len()],
        }
    }
}

/// Per-layer gradient buffers for one minibatch.
struct LayerGrads {
    w: Vec<Vec<f64>>,
    b: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Autoencoder {
    layers: Vec<DenseLayer>,
    /// Flattened input width: steps * features.
    input_dim: usize,
    steps: usize,
    features: usize,
    /// Per-feature-column normalization.
    norm_mean: Vec<f64>,
    norm_std: Vec<f64>,
    /// p95 of training reconstruction error.
    threshold: f64,
    p50: f64,
    p99: f64,
}

/// Training summary persisted with the artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceReport {
    pub train_samples: usize,
    pub final_loss: f64,
    pub threshold: f64,
    pub p50: f64,
    pub p99: f64,
}

impl Autoencoder {
    /// Fit on flattened sequences of length `steps * features`.
    pub fn train(
        sequences: &[Vec<f64>],
        steps: usize,
        features: usize,
        hidden: usize,
        epochs: usize,
        seed: u64,
    ) -> Result<(Self, SequenceReport), String> {
        let input_dim = steps * features;
        if sequences.is_empty() {
            return Err("empty training set".to_string());
        }
        if input_dim == 0 || sequences.iter().any(|s| s.len() != input_dim) {
            return Err("sequence length mismatch".to_string());
        }

        let (norm_mean, norm_std) = fit_feature_norm(sequences, features);
        let normalized: Vec<Vec<f64>> = sequences
            .iter()
            .map(|s| normalize(s, features, &norm_mean, &norm_std))
            .collect();

        let dims = layer_dims(input_dim, hidden);
        let mut rng = StdRng::seed_from_u64(seed);
        let layers: Vec<DenseLayer> = dims
            .windows(2)
            .map(|pair| DenseLayer::xavier(pair[0], pair[1], &mut rng))
            .collect();

        let mut model = Self {
            layers,
            input_dim,
            steps,
            features,
            norm_mean,
            norm_std,
            threshold: f64::MAX,
            p50: 0.0,
            p99: 0.0,
        };

        let mut adam: Vec<AdamState> = model.layers.iter().map(AdamState::zeros_like).collect();
        let mut t = 0u64;
        let mut order: Vec<usize> = (0..normalized.len()).collect();
        let mut final_loss = 0.0;

        for _epoch in 0..epochs {
            // Fisher-Yates with the training RNG keeps runs reproducible.
            for i in (1..order.len()).rev() {
                order.swap(i, rng.gen_range(0..=i));
            }
            let mut epoch_loss = 0.0;
            let mut batches = 0usize;
            for batch in order.chunks(BATCH_SIZE) {
                t += 1;
                epoch_loss += model.train_batch(&normalized, batch, &mut adam, t);
                batches += 1;
            }
            final_loss = epoch_loss / batches.max(1) as f64;
        }

        let mut errors: Vec<f64> = normalized.iter().map(|x| model.mse_normalized(x)).collect();
        errors.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        model.p50 = quantile(&errors, 0.50);
        model.threshold = quantile(&errors, 0.95);
        model.p99 = quantile(&errors, 0.99);

        let report = SequenceReport {
            train_samples: sequences.len(),
            final_loss,
            threshold: model.threshold,
            p50: model.p50,
            p99: model.p99,
        };
        Ok((model, report))
    }

    /// One minibatch of forward/backward passes plus an Adam step.
    /// Returns the mean sample loss.
    fn train_batch(
        &mut self,
        data: &[Vec<f64>],
        batch: &[usize],
        adam: &mut [AdamState],
        t: u64,
    ) -> f64 {
        let mut grads: Vec<LayerGrads> = self
            .layers
            .iter()
            .map(|layer| LayerGrads {
                w: layer.weights.iter().map(|r| vec![0.0; r.len()]).collect(),
                b: vec![0.0; layer.biases.len()],
            })
            .collect();

        let mut loss = 0.0;
        for &index in batch {
            loss += self.backprop(&data[index], &mut grads);
        }
        let scale = 1.0 / batch.len() as f64;
        loss *= scale;

        let bias_correct1 = 1.0 - ADAM_B1.powi(t as i32);
        let bias_correct2 = 1.0 - ADAM_B2.powi(t as i32);
        for ((layer, grad), state) in self.layers.iter_mut().zip(&grads).zip(adam.iter_mut()) {
            for o in 0..layer.biases.len() {
                for i in 0..layer.weights[o].len() {
                    let g = grad.w[o][i] * scale;
                    state.m_w[o][i] = ADAM_B1 * state.m_w[o][i] + (1.0 - ADAM_B1) * g;
                    state.v_w[o][i] = ADAM_B2 * state.v_w[o][i] + (1.0 - ADAM_B2) * g * g;
                    let m_hat = state.m_w[o][i] / bias_correct1;
                    let v_hat = state.v_w[o][i] / bias_correct2;
                    layer.weights[o][i] -= ADAM_LR * m_hat / (v_hat.sqrt() + ADAM_EPS);
                }
                let g = grad.b[o] * scale;
                state.m_b[o] = ADAM_B1 * state.m_b[o] + (1.0 - ADAM_B1) * g;
                state.v_b[o] = ADAM_B2 * state.v_b[o] + (1.0 - ADAM_B2) * g * g;
                let m_hat = state.m_b[o] / bias_correct1;
                let v_hat = state.v_b[o] / bias_correct2;
                layer.biases[o] -= ADAM_LR * m_hat / (v_hat.sqrt() + ADAM_EPS);
            }
        }
        loss
    }

    /// Forward + backward for one sample, accumulating into `grads`.
    /// Returns the sample's MSE.
    fn backprop(&self, x: &[f64], grads: &mut [LayerGrads]) -> f64 {
        let depth = self.layers.len();
        // Forward pass keeping pre-activations and activations.
        let mut pre: Vec<Vec<f64>> = Vec::with_capacity(depth);
        let mut act: Vec<Vec<f64>> = Vec::with_capacity(depth + 1);
        act.push(x.to_vec());
        for (l, layer) in self.layers.iter().enumerate() {
            let z = layer.forward(act.last().expect("activation"));
            let a = if l + 1 == depth {
                z.clone()
            } else {
                z.iter().map(|v| v.max(0.0)).collect()
            };
            pre.push(z);
            act.push(a);
        }

        let output = act.last().expect("output");
        let n_out = output.len() as f64;
        let loss = output
            .iter()
            .zip(x)
            .map(|(o, t)| (o - t).powi(2))
            .sum::<f64>()
            / n_out;

        // d(MSE)/d(output); the output layer is linear.
        let mut delta: Vec<f64> = output
            .iter()
            .zip(x)
            .map(|(o, t)| 2.0 * (o - t) / n_out)
            .collect();

        for l in (0..depth).rev() {
            let input = &act[l];
            for o in 0..delta.len() {
                grads[l].b[o] += delta[o];
                for i in 0..input.len() {
                    grads[l].w[o][i] += delta[o] * input[i];
                }
            }
            if l > 0 {
                let mut next = vec![0.0; input.len()];
                for o in 0..delta.len() {
                    for i in 0..input.len() {
                        next[i] += self.layers[l].weights[o][i] * delta[o];
                    }
                }
                // ReLU derivative against the previous pre-activation.
                for (v, z) in next.iter_mut().zip(&pre[l - 1]) {
                    if *z <= 0.0 {
                        *v = 0.0;
                    }
                }
                delta = next;
            }
        }
        loss
    }

    fn forward(&self, x: &[f64]) -> Vec<f64> {
        let depth = self.layers.len();
        let mut current = x.to_vec();
        for (l, layer) in self.layers.iter().enumerate() {
            current = layer.forward(&current);
            if l + 1 != depth {
                for v in &mut current {
                    *v = v.max(0.0);
                }
            }
        }
        current
    }

    fn mse_normalized(&self, x: &[f64]) -> f64 {
        let out = self.forward(x);
        out.iter().zip(x).map(|(o, t)| (o - t).powi(2)).sum::<f64>() / x.len() as f64
    }

    /// Reconstruction error of a raw (unnormalized) flattened sequence.
    pub fn reconstruction_error(&self, sequence: &[f64]) -> Result<f64, String> {
        if sequence.len() != self.input_dim {
            return Err(format!(
                "sequence length {} != {}",
                sequence.len(),
                self.input_dim
            ));
        }
        let x = normalize(sequence, self.features, &self.norm_mean, &self.norm_std);
        Ok(self.mse_normalized(&x))
    }

    pub fn is_anomalous(&self, error: f64) -> bool {
        error >= self.threshold
    }

    /// clamp((err - p50) / (p99 - p50)) into [0, 1].
    pub fn severity(&self, error: f64) -> f64 {
        let spread = self.p99 - self.p50;
        if spread <= f64::EPSILON {
            return if error >= self.threshold { 1.0 } else { 0.0 };
        }
        ((error - self.p50) / spread).clamp(0.0, 1.0)
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn sequence_length(&self) -> usize {
        self.steps
    }

    pub fn feature_width(&self) -> usize {
        self.features
    }
}

/// Encoder widths hidden -> hidden/2 -> hidden/4, mirrored back out.
fn layer_dims(input_dim: usize, hidden: usize) -> Vec<usize> {
    let h1 = hidden.max(4);
    let h2 = (h1 / 2).max(2);
    let h3 = (h1 / 4).max(2);
    vec![input_dim, h1, h2, h3, h2, h1, input_dim]
}

fn fit_feature_norm(sequences: &[Vec<f64>], features: usize) -> (Vec<f64>, Vec<f64>) {
    let mut mean = vec![0.0; features];
    let mut count = vec![0usize; features];
    for sequence in sequences {
        for (i, v) in sequence.iter().enumerate() {
            mean[i % features] += v;
            count[i % features] += 1;
        }
    }
    for (m, c) in mean.iter_mut().zip(&count) {
        *m /= (*c).max(1) as f64;
    }
    let mut var = vec![0.0; features];
    for sequence in sequences {
        for (i, v) in sequence.iter().enumerate() {
            var[i % features] += (v - mean[i % features]).powi(2);
        }
    }
    let std: Vec<f64> = var
        .iter()
        .zip(&count)
        .map(|(v, c)| {
            let s = (v / (*c).max(1) as f64).sqrt();
            // Avoid division by zero on constant features.
            if s < 1e-7 {
                1.0
            } else {
                s
            }
        })
        .collect();
    (mean, std)
}

fn normalize(sequence: &[f64], features: usize, mean: &[f64], std: &[f64]) -> Vec<f64> {
    sequence
        .iter()
        .enumerate()
        .map(|(i, v)| (v - mean[i % features]) / std[i % features])
        .collect()
}

fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEPS: usize = 6;
    const FEATURES: usize = 3;

    /// Sinusoid-ish healthy sequences: regular headways, small delays.
    fn healthy_sequences(n: usize) -> Vec<Vec<f64>> {
        let mut rng = StdRng::seed_from_u64(11);
        (0..n)
            .map(|_| {
                let mut seq = Vec::with_capacity(STEPS * FEATURES);
                for _ in 0..STEPS {
                    seq.push(180.0 + rng.gen_range(-20.0..20.0));
                    seq.push(rng.gen_range(-30.0..30.0));
                    seq.push(35.0 + rng.gen_range(-5.0..5.0));
                }
                seq
            })
            .collect()
    }

    fn disrupted_sequence() -> Vec<f64> {
        let mut seq = Vec::with_capacity(STEPS * FEATURES);
        for step in 0..STEPS {
            if step >= STEPS / 2 {
                seq.push(900.0);
                seq.push(600.0);
                seq.push(200.0);
            } else {
                seq.push(180.0);
                seq.push(0.0);
                seq.push(35.0);
            }
        }
        seq
    }

    fn trained() -> (Autoencoder, SequenceReport) {
        Autoencoder::train(&healthy_sequences(120), STEPS, FEATURES, 16, 40, 42).unwrap()
    }

    #[test]
    fn reconstructs_healthy_better_than_disrupted() {
        let (model, report) = trained();
        let healthy = &healthy_sequences(1)[0];
        let healthy_err = model.reconstruction_error(healthy).unwrap();
        let disrupted_err = model.reconstruction_error(&disrupted_sequence()).unwrap();
        assert!(
            disrupted_err > healthy_err,
            "disrupted {disrupted_err} healthy {healthy_err}"
        );
        assert!(model.is_anomalous(disrupted_err));
        assert!(report.threshold > 0.0);
    }

    #[test]
    fn severity_is_bounded_and_monotone() {
        let (model, _) = trained();
        let low = model.severity(model.p50);
        let mid = model.severity(model.threshold);
        let high = model.severity(model.p99 * 10.0);
        assert!((0.0..=1.0).contains(&low));
        assert!((0.0..=1.0).contains(&mid));
        assert_eq!(high, 1.0);
        assert!(low <= mid && mid <= high);
    }

    #[test]
    fn wrong_length_is_rejected() {
        let (model, _) = trained();
        assert!(model.reconstruction_error(&[1.0, 2.0]).is_err());
    }

    #[test]
    fn survives_serde_round_trip() {
        let (model, _) = trained();
        let bytes = serde_json::to_vec(&model).unwrap();
        let restored: Autoencoder = serde_json::from_slice(&bytes).unwrap();
        let seq = disrupted_sequence();
        let a = model.reconstruction_error(&seq).unwrap();
        let b = restored.reconstruction_error(&seq).unwrap();
        assert!((a - b).abs() < 1e-12);
    }

    #[test]
    fn training_is_deterministic_per_seed() {
        let data = healthy_sequences(60);
        let (a, _) = Autoencoder::train(&data, STEPS, FEATURES, 8, 10, 9).unwrap();
        let (b, _) = Autoencoder::train(&data, STEPS, FEATURES, 8, 10, 9).unwrap();
        let seq = disrupted_sequence();
        assert_eq!(
            a.reconstruction_error(&seq).unwrap(),
            b.reconstruction_error(&seq).unwrap()
        );
    }

    #[test]
    fn mismatched_training_rows_are_rejected() {
        let mut data = healthy_sequences(10);
        data.push(vec![1.0; 4]);
        assert!(Autoencoder::train(&data, STEPS, FEATURES, 8, 5, 1).is_err());
    }
}
