use anyhow::bail;
use log::debug;
use statrs::function::gamma::gamma_lr;

use crate::errors::ModelError;
use crate::Result;

const BISECTION_STEPS: usize = 200;

/// How the representative rate of each equal-probability gamma category is chosen.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum GammaMethod {
    /// Mean rate of the category.
    #[default]
    Mean,
    /// Median of the category, rescaled so that the rates average to one.
    Median,
}

/// Quantile of the gamma distribution with shape `alpha` and mean 1.
fn gamma_quantile(alpha: f64, p: f64) -> f64 {
    let cdf = |x: f64| gamma_lr(alpha, alpha * x);
    let mut hi = 1.0;
    while cdf(hi) < p {
        hi *= 2.0;
    }
    let mut lo = 0.0;
    for _ in 0..BISECTION_STEPS {
        let mid = 0.5 * (lo + hi);
        if cdf(mid) < p {
            lo = mid;
        } else {
            hi = mid;
        }
        if hi - lo <= f64::EPSILON * hi {
            break;
        }
    }
    0.5 * (lo + hi)
}

/// Rates of `k` equally probable categories approximating a gamma distribution
/// with shape `alpha` and mean 1.
pub fn discrete_gamma(alpha: f64, k: usize, method: GammaMethod) -> Result<Vec<f64>> {
    if !(alpha > 0.0 && alpha.is_finite()) {
        bail!(ModelError::ModelConfiguration(format!(
            "Gamma shape must be positive, got {}",
            alpha
        )));
    }
    if k == 0 {
        bail!(ModelError::ModelConfiguration(
            "Discrete gamma needs at least one category".to_string()
        ));
    }
    if k == 1 {
        return Ok(vec![1.0]);
    }
    let kf = k as f64;
    let rates = match method {
        GammaMethod::Mean => {
            let cuts: Vec<f64> = (1..k).map(|i| gamma_quantile(alpha, i as f64 / kf)).collect();
            let mut lower = 0.0;
            let mut rates = Vec::with_capacity(k);
            for i in 0..k {
                let upper = if i + 1 < k {
                    gamma_lr(alpha + 1.0, alpha * cuts[i])
                } else {
                    1.0
                };
                rates.push(kf * (upper - lower));
                lower = upper;
            }
            rates
        }
        GammaMethod::Median => {
            let medians: Vec<f64> = (0..k)
                .map(|i| gamma_quantile(alpha, (2 * i + 1) as f64 / (2.0 * kf)))
                .collect();
            let mean = medians.iter().sum::<f64>() / kf;
            medians.iter().map(|m| m / mean).collect()
        }
    };
    debug!("Discrete gamma rates for alpha {}: {:?}", alpha, rates);
    Ok(rates)
}
