//! Linear correction factors applied to raw sensor values.

use crate::schedule::Schedule;
use crate::types::SensorReading;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Key of the table entry used when no sensor-specific entry matches
pub const DEFAULT_CORRECTION_KEY: &str = "default";
/// Note attached to uncorrected values
pub const NO_CORRECTION_NOTE: &str = "no correction";

/// `max(0, slope * raw + intercept)`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinearCorrection {
    /// Multiplicative factor
    pub slope: f64,
    /// Additive offset (µg/m³)
    pub intercept: f64,
    /// Free text describing the correction origin
    #[serde(default)]
    pub note: String,
}

impl LinearCorrection {
    /// Corrected value, never negative
    pub fn apply(&self, raw: f64) -> f64 {
        (self.slope * raw + self.intercept).max(0.)
    }
}

/// Which table key provided the correction of a value
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CorrectionSource {
    /// Entry matching the sensor model
    SensorModel(String),
    /// Entry matching the sensor network
    SensorSource(String),
    /// The default entry
    Default,
    /// No entry applies, value left unchanged
    Uncorrected,
}

impl fmt::Display for CorrectionSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CorrectionSource::SensorModel(m) => write!(f, "sensor model {m}"),
            CorrectionSource::SensorSource(s) => write!(f, "sensor source {s}"),
            CorrectionSource::Default => write!(f, "{DEFAULT_CORRECTION_KEY}"),
            CorrectionSource::Uncorrected => write!(f, "none"),
        }
    }
}

/// A corrected value with its provenance
#[derive(Clone, Debug, PartialEq)]
pub struct Correction {
    /// Corrected value
    pub value: f64,
    /// Note of the applied correction
    pub note: String,
    /// Table key the correction comes from
    pub source: CorrectionSource,
}

impl Correction {
    /// Whether a correction was actually applied
    pub fn is_applied(&self) -> bool {
        self.source != CorrectionSource::Uncorrected
    }
}

/// Correction schedules keyed by sensor model or sensor source
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CorrectionTable {
    schedules: HashMap<String, Schedule<LinearCorrection>>,
}

impl CorrectionTable {
    /// Empty table, every value is left unchanged
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the schedule of a key
    pub fn insert(mut self, key: impl Into<String>, schedule: Schedule<LinearCorrection>) -> Self {
        self.schedules.insert(key.into(), schedule);
        self
    }

    /// Whether the table has no entry
    pub fn is_empty(&self) -> bool {
        self.schedules.is_empty()
    }

    /// Correct `raw` measured at `timestamp`.
    ///
    /// Entries are looked up in priority order: sensor model, sensor source, then the
    /// default key. The first key having a correction valid at `timestamp` is used.
    pub fn correct(
        &self,
        sensor_model: Option<&str>,
        sensor_source: Option<&str>,
        timestamp: &DateTime<Utc>,
        raw: f64,
    ) -> Correction {
        let candidates = [
            sensor_model.map(|m| (m, CorrectionSource::SensorModel(m.to_string()))),
            sensor_source.map(|s| (s, CorrectionSource::SensorSource(s.to_string()))),
            Some((DEFAULT_CORRECTION_KEY, CorrectionSource::Default)),
        ];
        candidates
            .into_iter()
            .flatten()
            .find_map(|(key, source)| {
                self.schedules
                    .get(key)
                    .and_then(|schedule| schedule.lookup(timestamp))
                    .map(|c| Correction {
                        value: c.apply(raw),
                        note: c.note.clone(),
                        source,
                    })
            })
            .unwrap_or_else(|| Correction {
                value: raw,
                note: NO_CORRECTION_NOTE.to_string(),
                source: CorrectionSource::Uncorrected,
            })
    }

    /// Correct a reading value
    pub fn correct_reading(&self, reading: &SensorReading) -> Correction {
        self.correct(
            reading.sensor_model.as_deref(),
            reading.sensor_source.as_deref(),
            &reading.timestamp,
            reading.value,
        )
    }
}
