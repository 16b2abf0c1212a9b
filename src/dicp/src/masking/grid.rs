//! Confidence mask geometry.
//!
//! A Cartesian mask is a square W×W image centred on the sensor; pixel
//! (row, col) has its centre at ((col − (W−1)/2)·res, (row − (W−1)/2)·res).
//! A polar mask has one row per azimuth and one column per range bin.

use std::f64::consts::{PI, TAU};

use nalgebra::{DMatrix, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Dense confidence mask in either Cartesian or polar layout.
///
/// Deserialized masks are checked by [`ConfidenceMask::cartesian`] and
/// [`ConfidenceMask::polar`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawConfidenceMask")]
pub enum ConfidenceMask {
    /// Square image; rows follow y, columns follow x.
    Cartesian {
        data: DMatrix<f64>,
        resolution: f64,
    },

    /// Rows are azimuths (radians), columns are range bins of width `resolution`.
    Polar {
        data: DMatrix<f64>,
        azimuths: Vec<f64>,
        resolution: f64,
    },
}

#[derive(Deserialize)]
enum RawConfidenceMask {
    Cartesian {
        data: DMatrix<f64>,
        resolution: f64,
    },
    Polar {
        data: DMatrix<f64>,
        azimuths: Vec<f64>,
        resolution: f64,
    },
}

impl TryFrom<RawConfidenceMask> for ConfidenceMask {
    type Error = Error;

    fn try_from(raw: RawConfidenceMask) -> Result<Self> {
        match raw {
            RawConfidenceMask::Cartesian { data, resolution } => Self::cartesian(data, resolution),
            RawConfidenceMask::Polar {
                data,
                azimuths,
                resolution,
            } => Self::polar(data, azimuths, resolution),
        }
    }
}

impl ConfidenceMask {
    /// Create a Cartesian mask.
    ///
    /// # Errors
    /// If the image is not square, the resolution is not positive, or a value
    /// is outside [0, 1].
    pub fn cartesian(data: DMatrix<f64>, resolution: f64) -> Result<Self> {
        if data.nrows() != data.ncols() || data.is_empty() {
            return Err(Error::InvalidMask(format!(
                "cartesian mask must be square and non-empty, got {}x{}",
                data.nrows(),
                data.ncols()
            )));
        }
        check_resolution(resolution)?;
        check_values(&data)?;
        Ok(Self::Cartesian { data, resolution })
    }

    /// Create a polar mask.
    ///
    /// # Errors
    /// If the azimuth count differs from the row count, the resolution is not
    /// positive, or a value is outside [0, 1].
    pub fn polar(data: DMatrix<f64>, azimuths: Vec<f64>, resolution: f64) -> Result<Self> {
        if azimuths.len() != data.nrows() || data.is_empty() {
            return Err(Error::InvalidMask(format!(
                "{} azimuths for a {}x{} polar mask",
                azimuths.len(),
                data.nrows(),
                data.ncols()
            )));
        }
        check_resolution(resolution)?;
        check_values(&data)?;
        Ok(Self::Polar {
            data,
            azimuths,
            resolution,
        })
    }

    /// Mask of ones with the same geometry.
    pub fn ones_like(&self) -> Self {
        let mut out = self.clone();
        match &mut out {
            Self::Cartesian { data, .. } | Self::Polar { data, .. } => data.fill(1.0),
        }
        out
    }

    pub fn data(&self) -> &DMatrix<f64> {
        match self {
            Self::Cartesian { data, .. } | Self::Polar { data, .. } => data,
        }
    }

    /// (rows, cols) of the underlying image.
    pub fn shape(&self) -> (usize, usize) {
        self.data().shape()
    }

    /// Pixel covering a point, or `None` if the point is outside the mask.
    pub fn pixel_of(&self, point: &Vector3<f64>) -> Option<(usize, usize)> {
        match self {
            Self::Cartesian { data, resolution } => {
                cartesian_pixel(point.x, point.y, data.nrows(), *resolution)
            }
            Self::Polar {
                data,
                azimuths,
                resolution,
            } => polar_pixel(point.x, point.y, azimuths, data.ncols(), *resolution),
        }
    }

    /// Mask value and pixel for a point.
    pub fn lookup(&self, point: &Vector3<f64>) -> Option<((usize, usize), f64)> {
        let pixel = self.pixel_of(point)?;
        self.data().get(pixel).map(|&value| (pixel, value))
    }
}

fn check_resolution(resolution: f64) -> Result<()> {
    if resolution > 0.0 && resolution.is_finite() {
        Ok(())
    } else {
        Err(Error::InvalidMask(format!(
            "resolution must be positive, got {resolution}"
        )))
    }
}

fn check_values(data: &DMatrix<f64>) -> Result<()> {
    match data.iter().find(|v| !v.is_finite() || **v < 0.0 || **v > 1.0) {
        Some(v) => Err(Error::InvalidMask(format!("mask value {v} is outside [0, 1]"))),
        None => Ok(()),
    }
}

/// Half side length of the usable Cartesian area.
///
/// (W/2 − 0.5)·res for even widths and W/2·res for odd widths.
pub fn cartesian_half_extent(width: usize, resolution: f64) -> f64 {
    let half = width as f64 / 2.0;
    if width % 2 == 0 {
        (half - 0.5) * resolution
    } else {
        half * resolution
    }
}

/// Nearest pixel of a Cartesian image, as (row, col).
pub fn cartesian_pixel(x: f64, y: f64, width: usize, resolution: f64) -> Option<(usize, usize)> {
    let extent = cartesian_half_extent(width, resolution);
    if !(x.abs() <= extent && y.abs() <= extent) {
        return None;
    }
    let centre = (width as f64 - 1.0) / 2.0;
    let last = (width - 1) as f64;
    let col = (x / resolution + centre).round().clamp(0.0, last) as usize;
    let row = (y / resolution + centre).round().clamp(0.0, last) as usize;
    Some((row, col))
}

/// Centre of a Cartesian pixel in metres, as (x, y).
pub fn cartesian_pixel_centre(row: usize, col: usize, width: usize, resolution: f64) -> (f64, f64) {
    let centre = (width as f64 - 1.0) / 2.0;
    (
        (col as f64 - centre) * resolution,
        (row as f64 - centre) * resolution,
    )
}

/// Shortest angular distance between two angles, in [0, π].
pub fn circular_distance(a: f64, b: f64) -> f64 {
    let d = (a - b).rem_euclid(TAU);
    if d > PI {
        TAU - d
    } else {
        d
    }
}

/// Index of the azimuth closest to `angle`.
pub fn nearest_azimuth(azimuths: &[f64], angle: f64) -> Option<usize> {
    azimuths
        .iter()
        .enumerate()
        .map(|(i, &a)| (i, circular_distance(a, angle)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
}

/// Nearest polar pixel, as (azimuth row, range bin).
pub fn polar_pixel(
    x: f64,
    y: f64,
    azimuths: &[f64],
    num_bins: usize,
    resolution: f64,
) -> Option<(usize, usize)> {
    let range = x.hypot(y);
    let bin = (range / resolution).floor();
    if !bin.is_finite() || bin >= num_bins as f64 {
        return None;
    }
    let row = nearest_azimuth(azimuths, y.atan2(x))?;
    Some((row, bin as usize))
}
