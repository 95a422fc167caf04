//! Records exchanged with the sensor store and the callers.

use crate::errors::{EstimateError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Meters per degree of latitude (spherical approximation)
const METERS_PER_DEGREE: f64 = 111_111.;

/// A raw sensor measurement as delivered by the sensor store
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Sensor identifier
    pub sensor_id: String,
    /// WGS84 latitude (degrees)
    pub latitude: f64,
    /// WGS84 longitude (degrees)
    pub longitude: f64,
    /// Elevation (meters) when known
    #[serde(default)]
    pub elevation: Option<f64>,
    /// Measurement time
    pub timestamp: DateTime<Utc>,
    /// PM2.5 concentration (µg/m³)
    pub value: f64,
    /// Sensor hardware model, used to select correction factors
    #[serde(default)]
    pub sensor_model: Option<String>,
    /// Sensor network the reading comes from
    #[serde(default)]
    pub sensor_source: Option<String>,
}

impl SensorReading {
    /// Check the reading is usable
    pub fn validate(&self) -> Result<()> {
        if self.sensor_id.is_empty() {
            return Err(EstimateError::InvalidQuery("empty sensor id".to_string()));
        }
        check_latlon(self.latitude, self.longitude)?;
        if !self.value.is_finite() {
            return Err(EstimateError::InvalidQuery(format!(
                "sensor {} reports a non finite value",
                self.sensor_id
            )));
        }
        if let Some(elevation) = self.elevation {
            if !elevation.is_finite() {
                return Err(EstimateError::InvalidQuery(format!(
                    "sensor {} has a non finite elevation",
                    self.sensor_id
                )));
            }
        }
        Ok(())
    }
}

/// A location where estimates are requested
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueryLocation {
    /// WGS84 latitude (degrees)
    pub latitude: f64,
    /// WGS84 longitude (degrees)
    pub longitude: f64,
    /// Elevation (meters), looked up from the area raster when absent
    #[serde(default)]
    pub elevation: Option<f64>,
}

impl QueryLocation {
    /// Location without elevation
    pub fn new(latitude: f64, longitude: f64) -> Self {
        QueryLocation {
            latitude,
            longitude,
            elevation: None,
        }
    }

    /// Location with a known elevation
    pub fn with_elevation(mut self, elevation: f64) -> Self {
        self.elevation = Some(elevation);
        self
    }

    /// Check coordinates are valid WGS84 degrees
    pub fn validate(&self) -> Result<()> {
        check_latlon(self.latitude, self.longitude)?;
        match self.elevation {
            Some(e) if !e.is_finite() => Err(EstimateError::InvalidQuery(
                "query elevation should be finite".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

fn check_latlon(latitude: f64, longitude: f64) -> Result<()> {
    if !(-90. ..=90.).contains(&latitude) || !(-180. ..=180.).contains(&longitude) {
        return Err(EstimateError::InvalidQuery(format!(
            "invalid coordinates lat={latitude} lon={longitude}"
        )));
    }
    Ok(())
}

/// Latitude/longitude rectangle
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Southern bound
    pub lat_min: f64,
    /// Northern bound
    pub lat_max: f64,
    /// Western bound
    pub lon_min: f64,
    /// Eastern bound
    pub lon_max: f64,
}

impl BoundingBox {
    /// Box of half-width `radius` meters around a point
    pub fn around(latitude: f64, longitude: f64, radius: f64) -> Self {
        let dlat = radius / METERS_PER_DEGREE;
        let dlon = radius / (METERS_PER_DEGREE * latitude.to_radians().cos().max(1e-6));
        BoundingBox {
            lat_min: latitude - dlat,
            lat_max: latitude + dlat,
            lon_min: longitude - dlon,
            lon_max: longitude + dlon,
        }
    }

    /// Smallest box containing all boxes of half-width `radius` around the given locations
    pub fn around_locations(locations: &[QueryLocation], radius: f64) -> Option<Self> {
        locations
            .iter()
            .map(|l| BoundingBox::around(l.latitude, l.longitude, radius))
            .reduce(|a, b| a.union(&b))
    }

    /// Smallest box containing both boxes
    pub fn union(&self, other: &BoundingBox) -> Self {
        BoundingBox {
            lat_min: self.lat_min.min(other.lat_min),
            lat_max: self.lat_max.max(other.lat_max),
            lon_min: self.lon_min.min(other.lon_min),
            lon_max: self.lon_max.max(other.lon_max),
        }
    }

    /// Whether the point lies inside the box (bounds included)
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        (self.lat_min..=self.lat_max).contains(&latitude)
            && (self.lon_min..=self.lon_max).contains(&longitude)
    }
}

/// Closed time interval `[start, end]`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// First instant
    pub start: DateTime<Utc>,
    /// Last instant
    pub end: DateTime<Utc>,
}

impl TimeRange {
    /// Constructor
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        TimeRange { start, end }
    }

    /// Whether `t` lies in the interval
    pub fn contains(&self, t: &DateTime<Utc>) -> bool {
        self.start <= *t && *t <= self.end
    }

    /// Interval widened by `padding` on both sides
    pub fn padded(&self, padding: Duration) -> Self {
        TimeRange {
            start: self.start - padding,
            end: self.end + padding,
        }
    }

    /// Regularly spaced times from start to end (included) every `interval_hours`
    pub fn sample(&self, interval_hours: f64) -> Result<Vec<DateTime<Utc>>> {
        if !(interval_hours.is_finite() && interval_hours > 0.) {
            return Err(EstimateError::InvalidQuery(format!(
                "sampling interval should be positive, got {interval_hours}"
            )));
        }
        if self.end < self.start {
            return Err(EstimateError::InvalidQuery(
                "query end is before query start".to_string(),
            ));
        }
        let step = hours(interval_hours);
        let mut times = vec![];
        let mut t = self.start;
        while t <= self.end {
            times.push(t);
            t += step;
        }
        Ok(times)
    }
}

/// Duration of a fractional number of hours, millisecond precision
pub fn hours(h: f64) -> Duration {
    Duration::milliseconds((h * 3_600_000.).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use chrono::TimeZone;

    #[test]
    fn test_bounding_box_around() {
        let bbox = BoundingBox::around(40., -111.9, 2. * 4300.);
        assert_abs_diff_eq!(bbox.lat_max - bbox.lat_min, 2. * 8600. / 111_111., epsilon = 1e-9);
        assert!(bbox.lon_max - bbox.lon_min > bbox.lat_max - bbox.lat_min);
        assert!(bbox.contains(40.05, -111.9));
        assert!(!bbox.contains(40.2, -111.9));
    }

    #[test]
    fn test_sample_times() {
        let start = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let range = TimeRange::new(start, start + Duration::hours(3));
        let times = range.sample(0.5).unwrap();
        assert_eq!(times.len(), 7);
        assert_eq!(times[6], range.end);
        assert!(range.sample(0.).is_err());
        assert!(TimeRange::new(range.end, range.start).sample(1.).is_err());
    }

    #[test]
    fn test_reading_validation() {
        let reading = SensorReading {
            sensor_id: "S1".to_string(),
            latitude: 40.7,
            longitude: -111.9,
            elevation: None,
            timestamp: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            value: 10.,
            sensor_model: None,
            sensor_source: None,
        };
        assert!(reading.validate().is_ok());
        let bad = SensorReading {
            latitude: 95.,
            ..reading.clone()
        };
        assert!(bad.validate().is_err());
        let bad = SensorReading {
            value: f64::NAN,
            ..reading
        };
        assert!(bad.validate().is_err());
    }
}
