//! Time-windowed values with a trailing default, and the length-scale schedule.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Values valid on `[start, end)` time windows, first match wins,
/// with an optional default used outside every window.
#[derive(Clone, Debug, PartialEq)]
pub struct Schedule<T> {
    windows: Vec<(DateTime<Utc>, DateTime<Utc>, T)>,
    default: Option<T>,
}

impl<T> Default for Schedule<T> {
    fn default() -> Self {
        Schedule {
            windows: vec![],
            default: None,
        }
    }
}

impl<T> Schedule<T> {
    /// Empty schedule
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value valid from `start` (included) to `end` (excluded)
    pub fn window(mut self, start: DateTime<Utc>, end: DateTime<Utc>, value: T) -> Self {
        self.windows.push((start, end, value));
        self
    }

    /// Set the value used outside every window
    pub fn default_value(mut self, value: T) -> Self {
        self.default = Some(value);
        self
    }

    /// Value applying at `t`
    pub fn lookup(&self, t: &DateTime<Utc>) -> Option<&T> {
        self.windows
            .iter()
            .find(|(start, end, _)| start <= t && t < end)
            .map(|(_, _, v)| v)
            .or(self.default.as_ref())
    }

    /// Whether the schedule holds no value at all
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty() && self.default.is_none()
    }
}

/// Kernel length scales of an area at a given time
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LengthScales {
    /// Planar length scale (meters)
    pub space: f64,
    /// Time length scale (hours)
    pub time: f64,
    /// Elevation length scale (meters)
    pub elevation: f64,
}

/// Length scales schedule of an area
pub type LengthScaleSchedule = Schedule<LengthScales>;

impl LengthScaleSchedule {
    /// Length scales applying at `t`, if any
    pub fn length_scales_for(&self, t: &DateTime<Utc>) -> Option<LengthScales> {
        self.lookup(t).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn scales(time: f64) -> LengthScales {
        LengthScales {
            space: 2000.,
            time,
            elevation: 100.,
        }
    }

    #[test]
    fn test_length_scales_lookup() {
        let t0 = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2022, 7, 1, 0, 0, 0).unwrap();
        let schedule = LengthScaleSchedule::new()
            .window(t0, t1, scales(0.25))
            .default_value(scales(1.));
        assert_eq!(schedule.length_scales_for(&t0), Some(scales(0.25)));
        assert_eq!(schedule.length_scales_for(&t1), Some(scales(1.)));

        let without_default = LengthScaleSchedule::new().window(t0, t1, scales(0.25));
        assert_eq!(without_default.length_scales_for(&t1), None);
        assert!(LengthScaleSchedule::new().is_empty());
    }
}
