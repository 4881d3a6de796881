//! Spherical sample values and the ordering rules applied before any
//! computation or output.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::Deref;

/// One luminous intensity reading at a point of the measurement sphere.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SphericalSample {
    /// Polar angle from the scan axis, degrees (0..=180)
    pub polar: f32,
    /// Azimuth around the scan axis, degrees (0..360)
    pub azimuth: f32,
    /// Luminous intensity, candela
    pub intensity: f64,
}

impl SphericalSample {
    pub fn new(polar: f32, azimuth: f32, intensity: f64) -> Self {
        Self {
            polar,
            azimuth,
            intensity,
        }
    }

    /// Orders by polar angle first, then azimuth. NaN angles compare equal.
    pub fn angular_cmp(&self, other: &Self) -> Ordering {
        self.polar
            .partial_cmp(&other.polar)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.azimuth.partial_cmp(&other.azimuth).unwrap_or(Ordering::Equal))
    }
}

impl fmt::Display for SphericalSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "θ={:.2}°, φ={:.2}°, I={:.4} cd",
            self.polar, self.azimuth, self.intensity
        )
    }
}

/// A frozen, sorted collection of samples.
///
/// Construction always sorts by (polar, azimuth) so every consumer sees the
/// grouped-ring order the photometry engine and the result writer rely on.
/// The sort is stable: samples sharing both angles keep their capture order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SampleSet {
    samples: Vec<SphericalSample>,
}

impl SampleSet {
    pub fn new(mut samples: Vec<SphericalSample>) -> Self {
        samples.sort_by(SphericalSample::angular_cmp);
        Self { samples }
    }

    pub fn as_slice(&self) -> &[SphericalSample] {
        &self.samples
    }

    pub fn into_vec(self) -> Vec<SphericalSample> {
        self.samples
    }

    /// Highest intensity in the set, starting from zero.
    pub fn max_intensity(&self) -> f64 {
        self.samples.iter().fold(0.0, |max, s| if s.intensity > max { s.intensity } else { max })
    }
}

impl Deref for SampleSet {
    type Target = [SphericalSample];

    fn deref(&self) -> &Self::Target {
        &self.samples
    }
}

impl From<Vec<SphericalSample>> for SampleSet {
    fn from(samples: Vec<SphericalSample>) -> Self {
        Self::new(samples)
    }
}

impl FromIterator<SphericalSample> for SampleSet {
    fn from_iter<T: IntoIterator<Item = SphericalSample>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a SampleSet {
    type Item = &'a SphericalSample;
    type IntoIter = std::slice::Iter<'a, SphericalSample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_set_sorts_by_polar_then_azimuth() {
        let set = SampleSet::new(vec![
            SphericalSample::new(10.0, 90.0, 1.0),
            SphericalSample::new(0.0, 0.0, 2.0),
            SphericalSample::new(10.0, 0.0, 3.0),
            SphericalSample::new(5.0, 270.0, 4.0),
        ]);
        let angles: Vec<(f32, f32)> = set.iter().map(|s| (s.polar, s.azimuth)).collect();
        assert_eq!(angles, vec![(0.0, 0.0), (5.0, 270.0), (10.0, 0.0), (10.0, 90.0)]);
    }

    #[test]
    fn duplicate_angles_keep_capture_order() {
        let set = SampleSet::new(vec![
            SphericalSample::new(10.0, 0.0, 1.0),
            SphericalSample::new(10.0, 0.0, 2.0),
        ]);
        assert_eq!(set[0].intensity, 1.0);
        assert_eq!(set[1].intensity, 2.0);
    }

    #[test]
    fn max_intensity_of_empty_set_is_zero() {
        assert_eq!(SampleSet::default().max_intensity(), 0.0);
    }
}
