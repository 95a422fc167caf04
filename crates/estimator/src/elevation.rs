//! Elevation lookup from a regular lon/lat raster.

use crate::errors::{EstimateError, Result};
use log::debug;
use ndarray::Array2;
use ndarray_npy::read_npy;
use std::path::Path;

/// Elevation (meters) at a WGS84 location
pub trait ElevationLookup: Send + Sync {
    /// Elevation at the given longitude and latitude
    fn elevation(&self, longitude: f64, latitude: f64) -> f64;
}

/// Same elevation everywhere
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ConstantElevation(pub f64);

impl ElevationLookup for ConstantElevation {
    fn elevation(&self, _longitude: f64, _latitude: f64) -> f64 {
        self.0
    }
}

/// Elevation raster on a regular grid.
///
/// Row `i` of the raster is latitude `lat_range.0 + i * dlat`, column `j` is longitude
/// `lon_range.0 + j * dlon`. Values are bilinearly interpolated, locations outside the
/// raster get 0.0.
#[derive(Clone, Debug, PartialEq)]
pub struct ElevationGrid {
    values: Array2<f64>,
    lon_range: (f64, f64),
    lat_range: (f64, f64),
}

impl ElevationGrid {
    /// Constructor from a (n_lat, n_lon) raster and its longitude and latitude extents
    pub fn new(values: Array2<f64>, lon_range: (f64, f64), lat_range: (f64, f64)) -> Result<Self> {
        let (nlat, nlon) = values.dim();
        if nlat < 2 || nlon < 2 {
            return Err(EstimateError::InvalidConfig(format!(
                "elevation raster should be at least 2x2, got {:?}",
                values.dim()
            )));
        }
        if !(lon_range.0 < lon_range.1 && lat_range.0 < lat_range.1) {
            return Err(EstimateError::InvalidConfig(format!(
                "elevation raster extents should be increasing, got lon {lon_range:?} lat {lat_range:?}"
            )));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(EstimateError::InvalidConfig(
                "elevation raster holds non finite values".to_string(),
            ));
        }
        Ok(ElevationGrid {
            values,
            lon_range,
            lat_range,
        })
    }

    /// Load a raster saved as a 2-D float64 `.npy` file
    pub fn from_npy<P: AsRef<Path>>(
        path: P,
        lon_range: (f64, f64),
        lat_range: (f64, f64),
    ) -> Result<Self> {
        let values: Array2<f64> = read_npy(path.as_ref())?;
        debug!(
            "Elevation raster {} loaded {:?}",
            path.as_ref().display(),
            values.dim()
        );
        Self::new(values, lon_range, lat_range)
    }

    /// Raster shape (n_lat, n_lon)
    pub fn dim(&self) -> (usize, usize) {
        self.values.dim()
    }
}

/// Fractional grid index of `x` on `n` points spanning `range`
fn grid_position(x: f64, range: (f64, f64), n: usize) -> Option<(usize, f64)> {
    if !(range.0..=range.1).contains(&x) {
        return None;
    }
    let pos = (x - range.0) / (range.1 - range.0) * (n - 1) as f64;
    let i = (pos.floor() as usize).min(n - 2);
    Some((i, pos - i as f64))
}

impl ElevationLookup for ElevationGrid {
    fn elevation(&self, longitude: f64, latitude: f64) -> f64 {
        let (nlat, nlon) = self.values.dim();
        match (
            grid_position(latitude, self.lat_range, nlat),
            grid_position(longitude, self.lon_range, nlon),
        ) {
            (Some((i, u)), Some((j, v))) => {
                let z = &self.values;
                (1. - u) * (1. - v) * z[[i, j]]
                    + (1. - u) * v * z[[i, j + 1]]
                    + u * (1. - v) * z[[i + 1, j]]
                    + u * v * z[[i + 1, j + 1]]
            }
            _ => 0.,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use ndarray_npy::write_npy;

    fn grid() -> ElevationGrid {
        // plane z = 1000 + 100 * lon_index + 10 * lat_index
        let values = Array2::from_shape_fn((3, 4), |(i, j)| 1000. + 100. * j as f64 + 10. * i as f64);
        ElevationGrid::new(values, (-112., -111.7), (40.5, 40.7)).unwrap()
    }

    #[test]
    fn test_bilinear_interpolation() {
        let grid = grid();
        assert_abs_diff_eq!(grid.elevation(-112., 40.5), 1000., epsilon = 1e-9);
        assert_abs_diff_eq!(grid.elevation(-111.7, 40.7), 1320., epsilon = 1e-9);
        // halfway between lon indices 1 and 2, lat index 0.5
        assert_abs_diff_eq!(grid.elevation(-111.85, 40.55), 1155., epsilon = 1e-9);
    }

    #[test]
    fn test_outside_raster() {
        let grid = grid();
        assert_eq!(grid.elevation(-113., 40.6), 0.);
        assert_eq!(grid.elevation(-111.9, 41.), 0.);
        assert_eq!(ConstantElevation(1300.).elevation(0., 0.), 1300.);
    }

    #[test]
    fn test_invalid_raster() {
        assert!(ElevationGrid::new(array![[1., 2.]], (0., 1.), (0., 1.)).is_err());
        assert!(ElevationGrid::new(Array2::zeros((2, 2)), (1., 0.), (0., 1.)).is_err());
    }

    #[test]
    fn test_from_npy() {
        let path = std::env::temp_dir().join("pmkrig_elevation_test.npy");
        write_npy(&path, &array![[0., 10.], [20., 30.]]).unwrap();
        let grid = ElevationGrid::from_npy(&path, (0., 1.), (0., 1.)).unwrap();
        assert_eq!(grid.dim(), (2, 2));
        assert_abs_diff_eq!(grid.elevation(0.5, 0.5), 15., epsilon = 1e-9);
        std::fs::remove_file(path).ok();
    }
}
