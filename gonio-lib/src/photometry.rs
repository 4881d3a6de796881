//! Luminous flux and beam width (FWHM) from a set of spherical samples.
//!
//! Both computations work purely in the angular domain: intensities are
//! expected in candela, so solid angles are never divided by distance².
//!
//! The sphere is split into latitude rings at multiples of the polar
//! resolution. Each sample contributes its intensity times the solid angle of
//! the azimuthal slice of its ring. Samples are matched to rings by exact
//! polar-angle equality; a sample that falls between two expected rings is
//! left out of the integral.

use crate::constants::FAR_POLE_DEG;
use crate::error::PhotometryError;
use crate::geometry::{SampleSet, SphericalSample};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::debug;

/// Angular step between two consecutive samples, degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// Polar step (resTheta)
    pub theta: f32,
    /// Azimuth step (resPhi)
    pub phi: f32,
}

impl Resolution {
    pub fn new(theta: f32, phi: f32) -> Self {
        Self { theta, phi }
    }

    pub fn validate(&self) -> Result<(), PhotometryError> {
        let theta_ok = self.theta.is_finite() && self.theta > 0.0 && self.theta <= 90.0;
        let phi_ok = self.phi.is_finite() && self.phi > 0.0 && self.phi <= 360.0;
        if theta_ok && phi_ok {
            Ok(())
        } else {
            Err(PhotometryError::InvalidResolution {
                res_theta: self.theta,
                res_phi: self.phi,
            })
        }
    }

    /// Number of samples of a semi-sphere scan: one pole sample plus every
    /// ring down to the equator.
    pub fn semi_sphere_count(&self) -> usize {
        ((360.0 / self.phi) * (90.0 / self.theta) + 1.0) as usize
    }

    /// Largest number of samples a full-sphere scan can produce: both poles
    /// sampled once, every ring in between sampled at each azimuth step.
    pub fn full_sphere_count(&self) -> usize {
        ((360.0 / self.phi) * ((180.0 / self.theta) - 1.0) + 2.0) as usize
    }
}

/// Which part of the sphere a scan covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum Coverage {
    #[strum(to_string = "semi-sphere")]
    SemiSphere,
    #[strum(to_string = "full sphere")]
    FullSphere,
}

/// Horizontal and vertical full width at half maximum, degrees.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Fwhm {
    pub horizontal: f32,
    pub vertical: f32,
}

/// Everything the photometry engine derives from one measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotometryReport {
    pub resolution: Resolution,
    pub actual_count: usize,
    pub expected_semi_sphere: usize,
    pub expected_full_sphere: usize,
    /// Luminous flux in lumens, or why it could not be computed
    pub flux: Result<f64, PhotometryError>,
    pub fwhm: Fwhm,
}

/// Runs both computations and records the sample-count expectations.
pub fn analyze(samples: &SampleSet, resolution: Resolution) -> PhotometryReport {
    let flux = compute_luminous_flux(samples, resolution);
    let fwhm = compute_hv_fwhm(samples);
    PhotometryReport {
        resolution,
        actual_count: samples.len(),
        expected_semi_sphere: resolution.semi_sphere_count(),
        expected_full_sphere: resolution.full_sphere_count(),
        flux,
        fwhm,
    }
}

/// Picks the integration path for `count` samples.
pub fn coverage_for(count: usize, resolution: Resolution) -> Result<Coverage, PhotometryError> {
    resolution.validate()?;
    let maximum = resolution.full_sphere_count();
    if count <= resolution.semi_sphere_count() {
        Ok(Coverage::SemiSphere)
    } else if count <= maximum {
        Ok(Coverage::FullSphere)
    } else {
        Err(PhotometryError::InconsistentSampleCount { actual: count, maximum })
    }
}

/// Total luminous flux in lumens.
pub fn compute_luminous_flux(samples: &SampleSet, resolution: Resolution) -> Result<f64, PhotometryError> {
    let coverage = coverage_for(samples.len(), resolution)?;
    let rings = RingLayout::new(coverage, resolution);

    let mut ring_sums = vec![0.0f64; rings.angles.len()];
    let mut unmatched = 0usize;
    for sample in samples {
        match rings.angles.iter().position(|&angle| sample.polar == angle) {
            Some(i) => ring_sums[i] += sample.intensity,
            None => unmatched += 1,
        }
    }
    if unmatched > 0 {
        debug!(unmatched, "samples off the expected rings were left out of the flux integral");
    }

    let flux = ring_sums
        .iter()
        .zip(&rings.slices)
        .map(|(sum, slice)| sum * slice)
        .sum();
    debug!(%coverage, rings = rings.angles.len(), flux, "luminous flux computed");
    Ok(flux)
}

/// Horizontal and vertical FWHM.
///
/// The horizontal beam width is read on the φ=0° and φ=180° cuts, the
/// vertical one on φ=90° and φ=270°. A far-pole sample (θ=180°) belongs to
/// all four cuts. On each cut the half-width is the polar angle of the sample
/// whose intensity is closest to half the maximum; when two samples are
/// equally close the one seen later in sorted order wins. That tie-break is
/// an implementation choice with no geometric meaning.
pub fn compute_hv_fwhm(samples: &SampleSet) -> Fwhm {
    let mut h1 = Vec::new();
    let mut h2 = Vec::new();
    let mut v1 = Vec::new();
    let mut v2 = Vec::new();

    for sample in samples {
        if sample.azimuth == 0.0 {
            h1.push(sample);
        } else if sample.azimuth == 180.0 {
            h2.push(sample);
        } else if sample.azimuth == 90.0 {
            v1.push(sample);
        } else if sample.azimuth == 270.0 {
            v2.push(sample);
        }
        if sample.polar == FAR_POLE_DEG {
            h1.push(sample);
            h2.push(sample);
            v1.push(sample);
            v2.push(sample);
        }
    }

    let half_max = samples.max_intensity() / 2.0;
    Fwhm {
        horizontal: closest_to_half_polar(half_max, &h1) + closest_to_half_polar(half_max, &h2),
        vertical: closest_to_half_polar(half_max, &v1) + closest_to_half_polar(half_max, &v2),
    }
}

fn closest_to_half_polar(half_max: f64, cut: &[&SphericalSample]) -> f32 {
    let mut polar = 0.0;
    let mut closest = f64::INFINITY;
    for sample in cut {
        let distance = (half_max - sample.intensity).abs();
        if distance <= closest {
            closest = distance;
            polar = sample.polar;
        }
    }
    polar
}

/// Expected ring angles and the solid angle of one azimuthal slice per ring.
struct RingLayout {
    angles: Vec<f32>,
    slices: Vec<f64>,
}

impl RingLayout {
    fn new(coverage: Coverage, res: Resolution) -> Self {
        let span = match coverage {
            Coverage::SemiSphere => 90.0,
            Coverage::FullSphere => 180.0,
        };
        let len = (span / res.theta + 1.0) as usize;
        let slice_phi = f64::from(res.phi).to_radians();

        let mut angles = vec![0.0f32; len];
        let mut slices = vec![0.0f64; len];

        // The pole is a cap sampled once, so its slice spans the full azimuth.
        let pole = (1.0 - f64::from(res.theta / 2.0).to_radians().cos()) * 2.0 * PI;
        slices[0] = pole;

        for n in 1..len - 1 {
            let low = f64::from((2 * (n - 1) + 1) as f32 * res.theta / 2.0);
            let high = f64::from((2 * n + 1) as f32 * res.theta / 2.0);
            slices[n] = (low.to_radians().cos() - high.to_radians().cos()) * slice_phi;
            angles[n] = res.theta * n as f32;
        }

        slices[len - 1] = match coverage {
            // The equator ring only extends half a step towards the pole.
            Coverage::SemiSphere => {
                let edge = f64::from(90.0 - res.theta / 2.0);
                (edge.to_radians().cos() - 90.0f64.to_radians().cos()) * slice_phi
            }
            Coverage::FullSphere => pole,
        };
        angles[len - 1] = res.theta * (len - 1) as f32;

        Self { angles, slices }
    }
}
