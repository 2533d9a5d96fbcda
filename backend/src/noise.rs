//! Planar Laplace noise for location releases (geo-indistinguishability).
//!
//! The mechanism runs on the client before a coordinate ever reaches the
//! server: it draws a polar offset whose radius follows the radial CDF of the
//! 2-D symmetric Laplace distribution (inverted via the lower Lambert W
//! branch), truncates the result to `rmax_km` and snaps it to a coarse grid.
//! Truncation and snapping are post-processing and keep the epsilon
//! guarantee intact.

use rand::Rng;

use crate::geo::{haversine_km, KM_PER_DEG_LAT};

/// Noise mechanism parameters. `epsilon` is the per-release privacy budget,
/// `rmax_km` bounds the displacement, `grid_unit` is the snap size in degrees.
#[derive(Debug, Clone, Copy)]
pub struct Noise {
    pub epsilon: f64,
    pub rmax_km: f64,
    pub grid_unit: f64,
}

impl Default for Noise {
    fn default() -> Self {
        Self { epsilon: 1.1, rmax_km: 3.0, grid_unit: 0.0005 }
    }
}

impl Noise {
    pub fn new(epsilon: f64, rmax_km: f64, grid_unit: f64) -> Self {
        Self { epsilon, rmax_km, grid_unit }
    }

    /// Polar offset sample: uniform angle, radius via inverse-CDF.
    /// r = -(1/eps) * (W_{-1}((u-1)/e) + 1), which is >= 0 since W_{-1} <= -1.
    fn sample_polar(&self, rng: &mut impl Rng) -> (f64, f64) {
        let theta = rng.gen_range(0.0..std::f64::consts::TAU);
        let u: f64 = rng.gen_range(0.0..1.0);
        let radius = -1.0 / self.epsilon * (lambert_w_m1((u - 1.0) / std::f64::consts::E) + 1.0);
        (radius, theta)
    }

    /// Perturb a true (lat, lon) into a release coordinate.
    pub fn perturb(&self, lat: f64, lon: f64, rng: &mut impl Rng) -> (f64, f64) {
        let (radius, theta) = self.sample_polar(rng);

        let dlat = radius * theta.cos() / KM_PER_DEG_LAT;
        let dlon = radius * theta.sin() / (KM_PER_DEG_LAT * lat.to_radians().cos());

        let mut noisy_lat = lat + dlat;
        let mut noisy_lon = lon + dlon;

        // Truncate to rmax. The randomized scale keeps truncated releases off
        // the exact rmax circle, which would otherwise form a visible spike.
        let distance = haversine_km(lat, lon, noisy_lat, noisy_lon);
        if distance > self.rmax_km {
            let scale = self.rmax_km / distance * rng.gen_range(0.7..1.0);
            noisy_lat = lat + (noisy_lat - lat) * scale;
            noisy_lon = lon + (noisy_lon - lon) * scale;
        }

        // Discretize to the grid. Snapping can nudge a borderline release a
        // few grid cells past rmax, so shrink the offset until the bound
        // holds for the snapped point as well.
        let snap = |x: f64| (x / self.grid_unit).round() * self.grid_unit;
        let mut out = (snap(noisy_lat), snap(noisy_lon));
        for _ in 0..64 {
            if haversine_km(lat, lon, out.0, out.1) <= self.rmax_km {
                break;
            }
            noisy_lat = lat + (noisy_lat - lat) * 0.99;
            noisy_lon = lon + (noisy_lon - lon) * 0.99;
            out = (snap(noisy_lat), snap(noisy_lon));
        }
        out
    }
}

/// Lower branch W_{-1} of the Lambert W function on [-1/e, 0).
///
/// Seeds with the branch-point series near -1/e and the log-log asymptote
/// near 0, then refines with Halley's method. Accuracy is far below the
/// float noise the sampler cares about.
pub fn lambert_w_m1(z: f64) -> f64 {
    debug_assert!(z < 0.0 && z >= -1.0 / std::f64::consts::E - 1e-12);

    let t = 1.0 + z * std::f64::consts::E;
    if t <= 1e-12 {
        // At (or numerically at) the branch point.
        return -1.0;
    }

    let mut w = if z < -0.2 {
        // Branch-point series in p = -sqrt(2(1 + e z)).
        let p = -(2.0 * t).sqrt();
        -1.0 + p - p * p / 3.0 + 11.0 / 72.0 * p * p * p
    } else {
        // Asymptotic seed: W ~ L1 - L2 + L2/L1 with L1 = ln(-z), L2 = ln(-L1).
        let l1 = (-z).ln();
        let l2 = (-l1).ln();
        l1 - l2 + l2 / l1
    };

    for _ in 0..50 {
        let ew = w.exp();
        let f = w * ew - z;
        let wp1 = w + 1.0;
        let denom = ew * wp1 - (w + 2.0) * f / (2.0 * wp1);
        let dw = f / denom;
        w -= dw;
        if dw.abs() <= 1e-12 * (1.0 + w.abs()) {
            break;
        }
    }
    w
}
