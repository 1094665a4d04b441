//! χ² distribution helpers for the analytic null and goodness-of-fit p-values.
//!
//! Thin wrappers over [`statrs::distribution::ChiSquared`] that validate their inputs and
//! report failures as [`Error::InvalidConfig`] instead of panicking.

use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::error::{Error, Result};

fn chi_squared(dof: f64) -> Result<ChiSquared> {
    if !(dof.is_finite() && dof > 0.0) {
        return Err(Error::config(format!(
            "degrees of freedom must be positive (got {dof})"
        )));
    }
    ChiSquared::new(dof).map_err(|e| Error::config(format!("χ²({dof}): {e}")))
}

/// CDF of the χ² distribution with `dof` degrees of freedom.
pub fn chi_square_cdf(x: f64, dof: f64) -> Result<f64> {
    if x <= 0.0 {
        return Ok(0.0);
    }
    Ok(chi_squared(dof)?.cdf(x))
}

/// Upper tail `P[X > x]` of the χ² distribution.
pub fn chi_square_sf(x: f64, dof: f64) -> Result<f64> {
    if x <= 0.0 {
        return Ok(1.0);
    }
    Ok(chi_squared(dof)?.sf(x))
}

/// Quantile of the χ² distribution.
///
/// `p` must lie in `[0, 1)`; `p = 0` gives 0.
pub fn chi_square_quantile(p: f64, dof: f64) -> Result<f64> {
    let dist = chi_squared(dof)?;
    if !(0.0..1.0).contains(&p) {
        return Err(Error::config(format!("quantile must lie in [0, 1) (got {p})")));
    }
    if p == 0.0 {
        return Ok(0.0);
    }
    Ok(dist.inverse_cdf(p))
}
