//! Classical detector masks and polar resampling.

use nalgebra::DMatrix;

use super::grid::{cartesian_pixel_centre, polar_pixel};
use crate::error::{Error, Result};

/// Threshold factor applied to each azimuth's mean power.
pub const DEFAULT_FFT_FACTOR: f64 = 3.0;

/// Binary mask marking returns stronger than `factor` times their row mean.
///
/// Rows are azimuths, columns are range bins of a polar power image.
pub fn fft_threshold_mask(fft: &DMatrix<f64>, factor: f64) -> DMatrix<f64> {
    let mut mask = DMatrix::zeros(fft.nrows(), fft.ncols());
    for (r, row) in fft.row_iter().enumerate() {
        let threshold = factor * row.mean();
        for (c, &v) in row.iter().enumerate() {
            if v > threshold {
                mask[(r, c)] = 1.0;
            }
        }
    }
    mask
}

/// Resample a polar image onto a `width`×`width` Cartesian grid.
///
/// Each Cartesian pixel takes the value of the polar bin nearest its centre;
/// pixels beyond the last range bin are 0.
///
/// # Arguments
/// * `mask` - Polar image (azimuths × range bins)
/// * `azimuths` - Azimuth of each row in radians
/// * `polar_resolution` - Range bin width in metres
/// * `cartesian_resolution` - Output pixel size in metres
/// * `width` - Output side length in pixels
pub fn polar_to_cartesian(
    mask: &DMatrix<f64>,
    azimuths: &[f64],
    polar_resolution: f64,
    cartesian_resolution: f64,
    width: usize,
) -> Result<DMatrix<f64>> {
    if azimuths.len() != mask.nrows() {
        return Err(Error::InvalidMask(format!(
            "{} azimuths for {} polar rows",
            azimuths.len(),
            mask.nrows()
        )));
    }
    if !(polar_resolution > 0.0 && cartesian_resolution > 0.0) {
        return Err(Error::InvalidMask(format!(
            "resolutions must be positive, got {polar_resolution} and {cartesian_resolution}"
        )));
    }

    Ok(DMatrix::from_fn(width, width, |row, col| {
        let (x, y) = cartesian_pixel_centre(row, col, width, cartesian_resolution);
        polar_pixel(x, y, azimuths, mask.ncols(), polar_resolution)
            .map(|pixel| mask[pixel])
            .unwrap_or(0.0)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn test_fft_threshold_per_row() {
        let fft = DMatrix::from_row_slice(2, 4, &[1.0, 1.0, 1.0, 10.0, 5.0, 5.0, 5.0, 5.0]);
        let mask = fft_threshold_mask(&fft, 2.0);
        // row 0 mean 3.25 -> only 10 passes 6.5; row 1 is flat
        assert_eq!(mask.row(0).iter().copied().collect::<Vec<_>>(), vec![0.0, 0.0, 0.0, 1.0]);
        assert!(mask.row(1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_polar_to_cartesian_constant() {
        let azimuths: Vec<f64> = (0..8).map(|i| i as f64 * PI / 4.0).collect();
        let polar = DMatrix::from_element(8, 10, 1.0);
        let cart = polar_to_cartesian(&polar, &azimuths, 1.0, 1.0, 5).unwrap();

        // all centres lie within 2·√2 < 10 m
        assert!(cart.iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_polar_to_cartesian_picks_nearest_bin() {
        let azimuths: Vec<f64> = (0..4).map(|i| i as f64 * PI / 2.0).collect();
        let mut polar = DMatrix::zeros(4, 3);
        polar[(0, 2)] = 1.0; // +x, 2-3 m
        let cart = polar_to_cartesian(&polar, &azimuths, 1.0, 1.0, 5).unwrap();

        // pixel (row 2, col 4) is at (2, 0)
        assert_eq!(cart[(2, 4)], 1.0);
        assert_eq!(cart[(2, 3)], 0.0);
        assert_eq!(cart[(4, 2)], 0.0);
    }

    #[test]
    fn test_polar_to_cartesian_rejects_mismatch() {
        assert!(polar_to_cartesian(&DMatrix::zeros(3, 3), &[0.0], 1.0, 1.0, 4).is_err());
    }
}
