use crate::config::{BinType, BinningConfig};
use anyhow::{bail, ensure, Result};
use ndarray::{Array, ArrayBase, Data, Dimension};

/// Margin kept away from the bin range ends and from the tails of the normal CDF.
pub const EPS: f64 = 1e-6;

/// Dimension-wise discretization of continuous values.
#[derive(Debug, Clone, PartialEq)]
pub struct BinTokenizer {
    pub n_bins: usize,
    pub bin_type: BinType,
    pub low: f32,
    pub high: f32,
    thresholds: Vec<f32>,
}

impl BinTokenizer {
    pub fn new(config: &BinningConfig) -> Result<Self> {
        ensure!(config.n_bins > 0, "bin tokenizer needs at least one bin");
        let n = config.n_bins;
        let thresholds: Vec<f32> = match config.bin_type {
            BinType::Uniform => {
                ensure!(
                    config.high - config.low > 2.0 * EPS as f32,
                    "uniform bins need low < high, got [{}, {}]",
                    config.low,
                    config.high
                );
                let (low, high) = (config.low as f64, config.high as f64);
                (0..=n)
                    .map(|i| (low + (high - low) * i as f64 / n as f64) as f32)
                    .collect()
            }
            BinType::Normal => (0..=n)
                .map(|i| {
                    let p = EPS + (1.0 - 2.0 * EPS) * i as f64 / n as f64;
                    inverse_normal_cdf(p) as f32
                })
                .collect(),
        };
        Ok(Self {
            n_bins: n,
            bin_type: config.bin_type,
            low: config.low,
            high: config.high,
            thresholds,
        })
    }

    pub fn thresholds(&self) -> &[f32] {
        &self.thresholds
    }

    pub fn bin_centers(&self) -> Vec<f32> {
        self.thresholds
            .windows(2)
            .map(|w| (w[0] + w[1]) / 2.0)
            .collect()
    }

    /// Index of the bin with `lo <= x < hi`. Uniform bins clip to the range ends;
    /// for normal bins values outside every bin map to 0.
    pub fn encode_value(&self, x: f32) -> usize {
        let x = match self.bin_type {
            BinType::Uniform => x.clamp(self.low + EPS as f32, self.high - EPS as f32),
            BinType::Normal => x,
        };
        let idx = self.thresholds.partition_point(|&t| t <= x);
        match self.bin_type {
            // The EPS margin vanishes in f32 for wide ranges.
            BinType::Uniform if idx > self.n_bins => self.n_bins - 1,
            _ if idx == 0 || idx > self.n_bins => 0,
            _ => idx - 1,
        }
    }

    pub fn encode<S, D>(&self, values: &ArrayBase<S, D>) -> Array<usize, D>
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        values.map(|&x| self.encode_value(x))
    }

    pub fn decode<S, D>(&self, tokens: &ArrayBase<S, D>) -> Result<Array<f32, D>>
    where
        S: Data<Elem = usize>,
        D: Dimension,
    {
        if let Some(&bad) = tokens.iter().find(|&&t| t >= self.n_bins) {
            bail!("bin token {} out of range for {} bins", bad, self.n_bins);
        }
        let centers = self.bin_centers();
        Ok(tokens.map(|&t| centers[t]))
    }
}

/// Quantile function of the standard normal (Acklam's rational approximation).
pub fn inverse_normal_cdf(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969683028665376e1,
        2.209460984245205e2,
        -2.759285104469687e2,
        1.383577518672690e2,
        -3.066479806614716e1,
        2.506628277459239e0,
    ];
    const B: [f64; 5] = [
        -5.447609879822406e1,
        1.615858368580409e2,
        -1.556989798598866e2,
        6.680131188771972e1,
        -1.328068155288572e1,
    ];
    const C: [f64; 6] = [
        -7.784894002430293e-3,
        -3.223964580411365e-1,
        -2.400758277161838e0,
        -2.549732539343734e0,
        4.374664141464968e0,
        2.938163982698783e0,
    ];
    const D: [f64; 4] = [
        7.784695709041462e-3,
        3.224671290700398e-1,
        2.445134137142996e0,
        3.754408661907416e0,
    ];
    const P_LOW: f64 = 0.02425;

    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    let tail = |q: f64| {
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    };
    if p < P_LOW {
        tail((-2.0 * p.ln()).sqrt())
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        -tail((-2.0 * (1.0 - p).ln()).sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn uniform(n_bins: usize) -> BinTokenizer {
        BinTokenizer::new(&BinningConfig {
            n_bins,
            bin_type: BinType::Uniform,
            low: -1.0,
            high: 1.0,
        })
        .unwrap()
    }

    #[test]
    fn normal_quantiles() {
        assert_abs_diff_eq!(inverse_normal_cdf(0.5), 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(inverse_normal_cdf(0.975), 1.959964, epsilon = 1e-5);
        assert_abs_diff_eq!(inverse_normal_cdf(0.01), -2.326348, epsilon = 1e-5);
    }

    #[test]
    fn uniform_round_trip_error_is_bounded_by_bin_width() {
        let tokenizer = uniform(256);
        let width = 2.0 / 256.0;
        let values = array![-0.999, -0.5, 0.0, 0.123, 0.77, 0.9999];
        let decoded = tokenizer.decode(&tokenizer.encode(&values)).unwrap();
        for (x, y) in values.iter().zip(decoded.iter()) {
            assert!((x - y).abs() <= width / 2.0 + 1e-6, "{x} -> {y}");
        }
    }

    #[test]
    fn uniform_clips_out_of_range_values() {
        let tokenizer = uniform(8);
        let tokens = tokenizer.encode(&array![-5.0f32, 5.0, 1.0, -1.0]);
        assert_eq!(tokens, array![0, 7, 7, 0]);
    }

    #[test]
    fn wide_uniform_range_clips_to_the_last_bin() {
        let tokenizer = BinTokenizer::new(&BinningConfig {
            n_bins: 8,
            bin_type: BinType::Uniform,
            low: -64.0,
            high: 64.0,
        })
        .unwrap();
        let tokens = tokenizer.encode(&array![64.0f32, 1000.0, -64.0, -1000.0]);
        assert_eq!(tokens, array![7, 7, 0, 0]);
        let decoded = tokenizer.decode(&tokens).unwrap();
        assert_abs_diff_eq!(decoded[0], 56.0, epsilon = 1e-4);
        assert_abs_diff_eq!(decoded[3], -56.0, epsilon = 1e-4);
    }

    #[test]
    fn normal_bins_cover_the_bulk_and_decode_midpoints() {
        let tokenizer = BinTokenizer::new(&BinningConfig {
            n_bins: 256,
            bin_type: BinType::Normal,
            low: 0.0,
            high: 1.0,
        })
        .unwrap();
        let thresholds = tokenizer.thresholds();
        assert_abs_diff_eq!(thresholds[0], -4.753424, epsilon = 1e-3);
        assert_abs_diff_eq!(thresholds[256], 4.753424, epsilon = 1e-3);

        let values = array![0.1f32, -0.3, 1.5];
        let tokens = tokenizer.encode(&values);
        let decoded = tokenizer.decode(&tokens).unwrap();
        for ((&x, &y), &t) in values.iter().zip(decoded.iter()).zip(tokens.iter()) {
            let width = thresholds[t + 1] - thresholds[t];
            assert!((x - y).abs() <= width / 2.0 + 1e-6);
        }
        // beyond the last threshold no bin matches
        assert_eq!(tokenizer.encode_value(10.0), 0);
    }

    #[test]
    fn decode_rejects_out_of_range_tokens() {
        let tokenizer = uniform(4);
        assert!(tokenizer.decode(&array![4usize]).is_err());
    }

    #[test]
    fn unknown_bin_type_fails_to_parse() {
        let parsed: Result<BinningConfig, _> =
            serde_json::from_str(r#"{"n_bins": 4, "bin_type": "laplace"}"#);
        assert!(parsed.is_err());
    }
}
