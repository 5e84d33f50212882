//! Cantilever case parameters.
//!
//! All quantities are SI base units (m, Pa, kg/m³, N). Conversion from user
//! units happens before a [`BeamCase`] is built.

use serde::{Deserialize, Serialize};

use crate::error::{JobError, JobResult};

/// Standard gravity in m/s².
pub const GRAVITY: f64 = 9.80665;

/// Geometry, material and load of a rectangular cantilever beam.
///
/// The beam is fixed at `z = 0` and loaded at its free end `z = length` in
/// the `-y` direction. Self-weight acts along `-y`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeamCase {
    pub name: String,
    pub length: f64,
    pub width: f64,
    pub height: f64,
    pub mesh_size: f64,
    /// Young's modulus.
    pub modulus: f64,
    pub poisson: f64,
    pub density: f64,
    pub material: String,
    /// Tip load.
    pub load: f64,
}

impl BeamCase {
    /// Check the physical ranges a solver can handle.
    pub fn validate(&self) -> JobResult<()> {
        if self.prefix().is_empty() {
            return Err(invalid("name must contain a letter or digit"));
        }
        for (field, value) in [
            ("length", self.length),
            ("width", self.width),
            ("height", self.height),
            ("mesh_size", self.mesh_size),
            ("modulus", self.modulus),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(invalid(&format!("{field} must be positive, got {value}")));
            }
        }
        if !(-1.0..=0.5).contains(&self.poisson) {
            return Err(invalid(&format!(
                "poisson must be within -1..=0.5, got {}",
                self.poisson
            )));
        }
        if !(self.density >= 0.0 && self.load >= 0.0) {
            return Err(invalid("density and load must be non-negative"));
        }
        Ok(())
    }

    /// File and directory prefix: the name lower-cased with whitespace and
    /// non-word characters removed.
    pub fn prefix(&self) -> String {
        sanitize(&self.name)
    }

    /// Cross-section area.
    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    /// Self-weight of the beam.
    pub fn weight(&self) -> f64 {
        self.length * self.area() * self.density * GRAVITY
    }
}

/// Lower-case, keep only ASCII alphanumerics, `_` and `-`.
pub fn sanitize(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

fn invalid(reason: &str) -> JobError {
    JobError::Configuration(format!("invalid beam case: {reason}"))
}

#[cfg(test)]
pub(crate) fn sample_case() -> BeamCase {
    BeamCase {
        name: "Steel Bar 1".into(),
        length: 1.0,
        width: 0.1,
        height: 0.05,
        mesh_size: 0.01,
        modulus: 200e9,
        poisson: 0.3,
        density: 7850.0,
        material: "Steel".into(),
        load: 1000.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_sanitizes_name() {
        assert_eq!(sample_case().prefix(), "steelbar1");
        assert_eq!(sanitize("My Beam (v2)/../x"), "mybeamv2x");
        assert_eq!(sanitize("  \t "), "");
    }

    #[test]
    fn test_weight() {
        let case = sample_case();
        let expected = 1.0 * 0.1 * 0.05 * 7850.0 * GRAVITY;
        assert!((case.weight() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_validate_ranges() {
        assert!(sample_case().validate().is_ok());

        let mut case = sample_case();
        case.height = 0.0;
        assert!(case.validate().is_err());

        let mut case = sample_case();
        case.poisson = 0.6;
        assert!(case.validate().is_err());

        let mut case = sample_case();
        case.name = "()".into();
        assert!(case.validate().is_err());
    }
}
