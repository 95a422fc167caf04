//! WGS84 to UTM forward projection.
//!
//! Every point of one request is projected in the same zone and hemisphere so that
//! planar distances stay consistent across zone boundaries.

use crate::errors::{EstimateError, Result};
use std::f64::consts::PI;

const K0: f64 = 0.9996;
const E: f64 = 0.00669438;
const E2: f64 = E * E;
const E3: f64 = E2 * E;
const E_P2: f64 = E / (1. - E);
const M1: f64 = 1. - E / 4. - 3. * E2 / 64. - 5. * E3 / 256.;
const M2: f64 = 3. * E / 8. + 3. * E2 / 32. + 45. * E3 / 1024.;
const M3: f64 = 15. * E2 / 256. + 45. * E3 / 1024.;
const M4: f64 = 35. * E3 / 3072.;
const R: f64 = 6_378_137.;

const FALSE_EASTING: f64 = 500_000.;
const FALSE_NORTHING: f64 = 10_000_000.;

/// UTM zone number of a location, Norway and Svalbard exceptions included
pub fn zone_number(latitude: f64, longitude: f64) -> u8 {
    if (56. ..64.).contains(&latitude) && (3. ..12.).contains(&longitude) {
        return 32;
    }
    if (72. ..=84.).contains(&latitude) && longitude >= 0. {
        if longitude < 9. {
            return 31;
        } else if longitude < 21. {
            return 33;
        } else if longitude < 33. {
            return 35;
        } else if longitude < 42. {
            return 37;
        }
    }
    if longitude >= 180. {
        return 60;
    }
    (((longitude + 180.) / 6.).floor() as i64).rem_euclid(60) as u8 + 1
}

fn central_longitude(zone: u8) -> f64 {
    (zone as f64 - 1.) * 6. - 180. + 3.
}

/// Angle wrapped in `[-π, π)`
fn mod_angle(value: f64) -> f64 {
    (value + PI).rem_euclid(2. * PI) - PI
}

/// Transverse Mercator projection on a fixed UTM zone and hemisphere
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UtmProjection {
    zone: u8,
    northern: bool,
}

impl UtmProjection {
    /// Projection on the zone and hemisphere of the given location
    pub fn for_location(latitude: f64, longitude: f64) -> Result<Self> {
        check_latitude(latitude)?;
        Ok(UtmProjection {
            zone: zone_number(latitude, longitude),
            northern: latitude >= 0.,
        })
    }

    /// Projection on a given zone (1 to 60)
    pub fn with_zone(zone: u8, northern: bool) -> Result<Self> {
        if !(1..=60).contains(&zone) {
            return Err(EstimateError::Projection(format!(
                "UTM zone should be in [1, 60], got {zone}"
            )));
        }
        Ok(UtmProjection { zone, northern })
    }

    /// Zone number
    pub fn zone(&self) -> u8 {
        self.zone
    }

    /// Easting and northing (meters) of a WGS84 location
    pub fn to_planar(&self, latitude: f64, longitude: f64) -> Result<(f64, f64)> {
        check_latitude(latitude)?;
        if !(-180. ..=180.).contains(&longitude) {
            return Err(EstimateError::Projection(format!(
                "longitude out of range (must be between 180 deg W and 180 deg E), got {longitude}"
            )));
        }
        let lat = latitude.to_radians();
        let (lat_sin, lat_cos) = lat.sin_cos();
        let lat_tan = lat_sin / lat_cos;
        let lat_tan2 = lat_tan * lat_tan;
        let lat_tan4 = lat_tan2 * lat_tan2;

        let n = R / (1. - E * lat_sin * lat_sin).sqrt();
        let c = E_P2 * lat_cos * lat_cos;
        let a = lat_cos * mod_angle(longitude.to_radians() - central_longitude(self.zone).to_radians());
        let (a2, a3) = (a * a, a * a * a);
        let (a4, a5, a6) = (a3 * a, a3 * a2, a3 * a3);
        let m = R
            * (M1 * lat - M2 * (2. * lat).sin() + M3 * (4. * lat).sin() - M4 * (6. * lat).sin());

        let easting = K0
            * n
            * (a + a3 / 6. * (1. - lat_tan2 + c)
                + a5 / 120. * (5. - 18. * lat_tan2 + lat_tan4 + 72. * c - 58. * E_P2))
            + FALSE_EASTING;
        let mut northing = K0
            * (m + n
                * lat_tan
                * (a2 / 2.
                    + a4 / 24. * (5. - lat_tan2 + 9. * c + 4. * c * c)
                    + a6 / 720. * (61. - 58. * lat_tan2 + lat_tan4 + 600. * c - 330. * E_P2)));
        if !self.northern {
            northing += FALSE_NORTHING;
        }
        Ok((easting, northing))
    }
}

fn check_latitude(latitude: f64) -> Result<()> {
    if (-80. ..=84.).contains(&latitude) {
        Ok(())
    } else {
        Err(EstimateError::Projection(format!(
            "latitude out of range (must be between 80 deg S and 84 deg N), got {latitude}"
        )))
    }
}
