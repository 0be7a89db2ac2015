// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-message timing summary.

/// Distribution of per-message times (nanoseconds)
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub samples: usize,
    pub mean: f64,
    pub stddev: f64,
    /// Min, 20%, 40%, 60%, 80%, max
    pub quintiles: [f64; 6],
    pub p5: f64,
    pub median: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Summarise `samples`, discarding the first 5% as warm-up.
///
/// Returns `None` when nothing is left after the discard.
pub fn summarise(samples: &[f64]) -> Option<Summary> {
    let discard = samples.len() / 20;
    let mut sorted = samples[discard..].to_vec();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(f64::total_cmp);

    let n = sorted.len();
    let mean = sorted.iter().sum::<f64>() / n as f64;
    let variance = sorted.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
    let at = |num: usize, den: usize| sorted[(n * num / den).min(n - 1)];

    Some(Summary {
        samples: n,
        mean,
        stddev: variance.sqrt(),
        quintiles: [at(0, 5), at(1, 5), at(2, 5), at(3, 5), at(4, 5), sorted[n - 1]],
        p5: at(1, 20),
        median: at(1, 2),
        p95: at(19, 20),
        p99: at(99, 100),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty() {
        assert!(summarise(&[]).is_none());
    }

    #[test]
    fn test_warm_up_discarded() {
        // 100 samples: the first 5 are huge outliers and must not count
        let mut samples = vec![1e9; 5];
        samples.extend((0..95).map(f64::from));
        let s = summarise(&samples).expect("summary");
        assert_eq!(s.samples, 95);
        assert_eq!(s.quintiles[0], 0.0);
        assert_eq!(s.quintiles[5], 94.0);
        assert!((s.mean - 47.0).abs() < 1e-9);
    }

    #[test]
    fn test_percentiles_ordered() {
        let samples: Vec<f64> = (0..1000).rev().map(f64::from).collect();
        let s = summarise(&samples).expect("summary");
        assert!(s.p5 <= s.median && s.median <= s.p95 && s.p95 <= s.p99);
        assert!(s.quintiles.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_constant_samples() {
        let s = summarise(&[7.0; 40]).expect("summary");
        assert_eq!(s.stddev, 0.0);
        assert_eq!(s.median, 7.0);
        assert_eq!(s.p99, 7.0);
    }
}
