// ── Canopy Tree: Clustering ────────────────────────────────────────────────
//
// Groups sibling candidates at one layer into clusters for summarization:
//
//   1. Reduce vectors to `reduction_dimension` dims (pluggable reducer;
//      the default is a seeded Gaussian random projection)
//   2. Fit spherical Gaussian mixtures by EM for k = 1..k_max, pick k by BIC
//   3. Soft-assign: a node joins every component whose responsibility
//      clears `soft_threshold` (always at least its argmax component)
//
// Multi-assignment is allowed — children flow parent→child, so a node held
// by two parents stays well-defined (DAG, not strict tree).
//
// Determinism: fixed seed + fixed vectors ⇒ identical clusters, and each
// cluster lists members in ascending node-index order.

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// ═══════════════════════════════════════════════════════════════════════════
// Reducer
// ═══════════════════════════════════════════════════════════════════════════

pub trait DimensionReducer: Send + Sync {
    fn reduce(&self, vectors: &[Vec<f32>], target_dim: usize) -> Vec<Vec<f32>>;
}

/// Seeded Gaussian random projection. Cheap, deterministic, and adequate
/// for separating cluster structure before EM; the scale factor preserves
/// expected norms.
pub struct RandomProjectionReducer {
    pub seed: u64,
}

impl DimensionReducer for RandomProjectionReducer {
    fn reduce(&self, vectors: &[Vec<f32>], target_dim: usize) -> Vec<Vec<f32>> {
        if vectors.is_empty() {
            return Vec::new();
        }
        let source_dim = vectors[0].len();
        if source_dim <= target_dim {
            return vectors.to_vec();
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let scale = 1.0 / (target_dim as f32).sqrt();
        // Row-major projection matrix [target_dim][source_dim].
        let matrix: Vec<Vec<f32>> = (0..target_dim)
            .map(|_| (0..source_dim).map(|_| gaussian(&mut rng) * scale).collect())
            .collect();

        vectors
            .iter()
            .map(|v| {
                matrix
                    .iter()
                    .map(|row| row.iter().zip(v.iter()).map(|(a, b)| a * b).sum())
                    .collect()
            })
            .collect()
    }
}

/// Box-Muller standard normal.
fn gaussian(rng: &mut StdRng) -> f32 {
    let u1: f32 = rng.gen_range(1e-6f32..1.0);
    let u2: f32 = rng.gen_range(0.0f32..1.0);
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}

// ═══════════════════════════════════════════════════════════════════════════
// Parameters
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct ClusteringParams {
    /// Upper bound on mixture components tried during BIC selection.
    pub max_components: usize,
    /// Responsibility threshold for soft multi-assignment.
    pub soft_threshold: f64,
    pub seed: u64,
    /// EM iterations per candidate k.
    pub em_iterations: usize,
}

impl Default for ClusteringParams {
    fn default() -> Self {
        Self { max_components: 50, soft_threshold: 0.1, seed: 224, em_iterations: 25 }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Entry point
// ═══════════════════════════════════════════════════════════════════════════

/// Partition `(node_index, vector)` pairs into clusters of node indices.
///
/// Input order does not matter; output clusters are sorted internally by
/// node index and externally by their smallest member.
pub fn perform_clustering(
    nodes: &[(u64, Vec<f32>)],
    reduction_dimension: usize,
    params: &ClusteringParams,
) -> Vec<Vec<u64>> {
    if nodes.is_empty() {
        return Vec::new();
    }
    if nodes.len() == 1 {
        return vec![vec![nodes[0].0]];
    }

    // Work over ascending node index so the RNG consumption — and therefore
    // the result — is independent of caller ordering.
    let mut ordered: Vec<&(u64, Vec<f32>)> = nodes.iter().collect();
    ordered.sort_by_key(|(idx, _)| *idx);

    let vectors: Vec<Vec<f32>> = ordered.iter().map(|(_, v)| v.clone()).collect();
    let reducer = RandomProjectionReducer { seed: params.seed };
    let reduced = reducer.reduce(&vectors, reduction_dimension.max(2));

    let n = reduced.len();
    let dim = reduced[0].len();
    let data: Vec<Vec<f64>> =
        reduced.iter().map(|v| v.iter().map(|x| *x as f64).collect()).collect();

    let k_max = params.max_components.min(n.max(1));
    let mut best: Option<(f64, GmmFit)> = None;

    for k in 1..=k_max {
        let fit = fit_gmm(&data, k, params.seed.wrapping_add(k as u64), params.em_iterations);
        let bic = fit.bic(n, dim);
        match &best {
            Some((best_bic, _)) if bic >= *best_bic => {
                // BIC worsened; mixtures rarely recover past here.
                if k > 2 {
                    break;
                }
            }
            _ => best = Some((bic, fit)),
        }
    }

    let fit = match best {
        Some((_, f)) => f,
        None => return vec![ordered.iter().map(|(i, _)| *i).collect()],
    };

    let mut clusters: Vec<Vec<u64>> = vec![Vec::new(); fit.k];
    for (row, (node_idx, _)) in ordered.iter().enumerate() {
        let resp = fit.responsibilities(&data[row]);
        let argmax = resp
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i)
            .unwrap_or(0);
        for (component, r) in resp.iter().enumerate() {
            if component == argmax || *r >= params.soft_threshold {
                clusters[component].push(*node_idx);
            }
        }
    }

    clusters.retain(|c| !c.is_empty());
    for cluster in &mut clusters {
        cluster.sort_unstable();
    }
    clusters.sort_by_key(|c| c[0]);

    debug!(
        "[canopy:cluster] n={} dim={} k={} clusters={}",
        n,
        dim,
        fit.k,
        clusters.len()
    );
    clusters
}

// ═══════════════════════════════════════════════════════════════════════════
// Spherical GMM (EM)
// ═══════════════════════════════════════════════════════════════════════════

struct GmmFit {
    k: usize,
    means: Vec<Vec<f64>>,
    variances: Vec<f64>,
    weights: Vec<f64>,
    log_likelihood: f64,
}

impl GmmFit {
    /// Free parameters of a spherical mixture: k·d means + k variances +
    /// (k−1) weights.
    fn bic(&self, n: usize, dim: usize) -> f64 {
        let p = (self.k * dim + self.k + (self.k - 1).max(0)) as f64;
        -2.0 * self.log_likelihood + p * (n as f64).ln()
    }

    fn responsibilities(&self, x: &[f64]) -> Vec<f64> {
        let logs: Vec<f64> = (0..self.k)
            .map(|c| self.weights[c].max(1e-12).ln() + log_gauss(x, &self.means[c], self.variances[c]))
            .collect();
        let max = logs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let exps: Vec<f64> = logs.iter().map(|l| (l - max).exp()).collect();
        let total: f64 = exps.iter().sum();
        exps.iter().map(|e| e / total.max(1e-300)).collect()
    }
}

fn log_gauss(x: &[f64], mean: &[f64], variance: f64) -> f64 {
    let var = variance.max(1e-6);
    let d = x.len() as f64;
    let sq: f64 = x.iter().zip(mean.iter()).map(|(a, b)| (a - b) * (a - b)).sum();
    -0.5 * (d * (2.0 * std::f64::consts::PI * var).ln() + sq / var)
}

fn fit_gmm(data: &[Vec<f64>], k: usize, seed: u64, iterations: usize) -> GmmFit {
    let n = data.len();
    let dim = data[0].len();
    let mut rng = StdRng::seed_from_u64(seed);

    // k-means++-style seeding: spread the initial means.
    let mut means: Vec<Vec<f64>> = Vec::with_capacity(k);
    means.push(data[rng.gen_range(0..n)].clone());
    while means.len() < k {
        let dists: Vec<f64> = data
            .iter()
            .map(|x| {
                means
                    .iter()
                    .map(|m| sq_dist(x, m))
                    .fold(f64::INFINITY, f64::min)
            })
            .collect();
        let total: f64 = dists.iter().sum();
        if total <= 0.0 {
            means.push(data[rng.gen_range(0..n)].clone());
            continue;
        }
        let mut target = rng.gen_range(0.0..total);
        let mut chosen = n - 1;
        for (i, d) in dists.iter().enumerate() {
            target -= d;
            if target <= 0.0 {
                chosen = i;
                break;
            }
        }
        means.push(data[chosen].clone());
    }

    let mut variances = vec![overall_variance(data).max(1e-4); k];
    let mut weights = vec![1.0 / k as f64; k];
    let mut log_likelihood = f64::NEG_INFINITY;

    for _ in 0..iterations {
        // E-step
        let mut resp = vec![vec![0.0f64; k]; n];
        let mut new_ll = 0.0f64;
        for (i, x) in data.iter().enumerate() {
            let logs: Vec<f64> = (0..k)
                .map(|c| weights[c].max(1e-12).ln() + log_gauss(x, &means[c], variances[c]))
                .collect();
            let max = logs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let exps: Vec<f64> = logs.iter().map(|l| (l - max).exp()).collect();
            let total: f64 = exps.iter().sum();
            for c in 0..k {
                resp[i][c] = exps[c] / total.max(1e-300);
            }
            new_ll += max + total.ln();
        }

        // M-step
        for c in 0..k {
            let nk: f64 = resp.iter().map(|r| r[c]).sum();
            if nk < 1e-9 {
                continue;
            }
            weights[c] = nk / n as f64;
            let mut mean = vec![0.0f64; dim];
            for (i, x) in data.iter().enumerate() {
                for (j, xv) in x.iter().enumerate() {
                    mean[j] += resp[i][c] * xv;
                }
            }
            for m in mean.iter_mut() {
                *m /= nk;
            }
            let mut var = 0.0f64;
            for (i, x) in data.iter().enumerate() {
                var += resp[i][c] * sq_dist(x, &mean);
            }
            variances[c] = (var / (nk * dim as f64)).max(1e-6);
            means[c] = mean;
        }

        if (new_ll - log_likelihood).abs() < 1e-6 {
            log_likelihood = new_ll;
            break;
        }
        log_likelihood = new_ll;
    }

    GmmFit { k, means, variances, weights, log_likelihood }
}

fn sq_dist(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

fn overall_variance(data: &[Vec<f64>]) -> f64 {
    let n = data.len();
    let dim = data[0].len();
    let mut mean = vec![0.0f64; dim];
    for x in data {
        for (j, v) in x.iter().enumerate() {
            mean[j] += v;
        }
    }
    for m in mean.iter_mut() {
        *m /= n as f64;
    }
    data.iter().map(|x| sq_dist(x, &mean)).sum::<f64>() / (n * dim) as f64
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════
