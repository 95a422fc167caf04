//! Split of long query time ranges into padded chunks.

use crate::errors::{EstimateError, Result};
use crate::types::{hours, TimeRange};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Chunk sizes expressed in time length scales
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Chunk length in time length scales
    pub chunk_factor: f64,
    /// Padding on each side of a chunk in time length scales
    pub padding_factor: f64,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        ChunkConfig {
            chunk_factor: 20.,
            padding_factor: 3.,
        }
    }
}

impl ChunkConfig {
    /// Check factors are positive
    pub fn validate(&self) -> Result<()> {
        if !(self.chunk_factor.is_finite() && self.chunk_factor > 0.)
            || !(self.padding_factor.is_finite() && self.padding_factor >= 0.)
        {
            return Err(EstimateError::InvalidConfig(format!(
                "chunk factor should be positive and padding factor non negative, got {self:?}"
            )));
        }
        Ok(())
    }
}

/// A sub-range of the query times estimated from one model
#[derive(Clone, Debug, PartialEq)]
pub struct QueryChunk {
    /// Chunk position in the request
    pub index: usize,
    /// Indices of the query times of the chunk
    pub queries: Range<usize>,
    /// From the first to the last query time of the chunk
    pub window: TimeRange,
    /// Window widened by the padding, readings of this range train the model
    pub padded: TimeRange,
}

impl QueryChunk {
    /// Number of query times in the chunk
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    /// Whether the chunk has no query time
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

/// Group sorted query `times` into chunks spanning less than
/// `chunk_factor x time_length_scale` hours, each padded by
/// `padding_factor x time_length_scale` hours on both sides.
pub fn split_queries(
    times: &[DateTime<Utc>],
    time_length_scale: f64,
    config: &ChunkConfig,
) -> Result<Vec<QueryChunk>> {
    config.validate()?;
    if !(time_length_scale.is_finite() && time_length_scale > 0.) {
        return Err(EstimateError::InvalidConfig(format!(
            "time length scale should be positive, got {time_length_scale}"
        )));
    }
    if times.windows(2).any(|w| w[1] < w[0]) {
        return Err(EstimateError::InvalidQuery(
            "query times should be sorted".to_string(),
        ));
    }
    let chunk_length = hours(config.chunk_factor * time_length_scale);
    let padding = hours(config.padding_factor * time_length_scale);

    let mut chunks = vec![];
    let mut first = 0;
    while first < times.len() {
        let limit = times[first] + chunk_length;
        let last = first
            + times[first..]
                .iter()
                .skip(1)
                .take_while(|t| **t < limit)
                .count();
        let window = TimeRange::new(times[first], times[last]);
        chunks.push(QueryChunk {
            index: chunks.len(),
            queries: first..last + 1,
            window,
            padded: window.padded(padding),
        });
        first = last + 1;
    }
    Ok(chunks)
}
