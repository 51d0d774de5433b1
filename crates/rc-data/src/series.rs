//! SCLK-indexed multi-channel telemetry table.

use rc_types::TelemetryError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the time axis when a series is written out as a table.
pub const SCLK: &str = "SCLK";

/// A single channel's samples, aligned with the series index.
#[derive(Debug, Clone, PartialEq)]
pub enum Column {
    Numeric(Vec<Option<f64>>),
    Flag(Vec<Option<bool>>),
}

impl Column {
    pub fn len(&self) -> usize {
        match self {
            Self::Numeric(values) => values.len(),
            Self::Flag(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_numeric(&self) -> Option<&[Option<f64>]> {
        match self {
            Self::Numeric(values) => Some(values),
            Self::Flag(_) => None,
        }
    }

    pub fn as_flag(&self) -> Option<&[Option<bool>]> {
        match self {
            Self::Flag(values) => Some(values),
            Self::Numeric(_) => None,
        }
    }

    fn select(&self, rows: &[usize]) -> Self {
        match self {
            Self::Numeric(values) => Self::Numeric(rows.iter().map(|&r| values[r]).collect()),
            Self::Flag(values) => Self::Flag(rows.iter().map(|&r| values[r]).collect()),
        }
    }
}

/// Inclusive SCLK interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: f64,
    pub end: f64,
}

impl TimeRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, t: f64) -> bool {
        t >= self.start && t <= self.end
    }

    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Time-indexed table of named channels.
///
/// The index is strictly increasing and every column has exactly one entry
/// per index value. Missing samples are `None`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TelemetrySeries {
    index: Vec<f64>,
    channels: BTreeMap<String, Column>,
}

impl TelemetrySeries {
    /// Build a series, checking index order and column lengths.
    pub fn from_columns(
        index: Vec<f64>,
        channels: BTreeMap<String, Column>,
    ) -> Result<Self, TelemetryError> {
        if let Some(pos) = index.windows(2).position(|w| !(w[0] < w[1])) {
            return Err(TelemetryError::parse(
                SCLK,
                format!("index not strictly increasing at row {}", pos + 1),
            ));
        }
        for (name, column) in &channels {
            if column.len() != index.len() {
                return Err(TelemetryError::parse(
                    name.as_str(),
                    format!("column has {} rows, index has {}", column.len(), index.len()),
                ));
            }
        }
        Ok(Self { index, channels })
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn index(&self) -> &[f64] {
        &self.index
    }

    /// First and last timestamp.
    pub fn span(&self) -> Option<TimeRange> {
        match (self.index.first(), self.index.last()) {
            (Some(&start), Some(&end)) => Some(TimeRange::new(start, end)),
            _ => None,
        }
    }

    pub fn channel(&self, name: &str) -> Option<&Column> {
        self.channels.get(name)
    }

    pub fn channels(&self) -> impl Iterator<Item = (&str, &Column)> {
        self.channels.iter().map(|(name, column)| (name.as_str(), column))
    }

    pub fn channel_names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    pub fn has_channel(&self, name: &str) -> bool {
        self.channels.contains_key(name)
    }

    pub fn numeric(&self, name: &str) -> Option<&[Option<f64>]> {
        self.channels.get(name).and_then(Column::as_numeric)
    }

    pub fn flag(&self, name: &str) -> Option<&[Option<bool>]> {
        self.channels.get(name).and_then(Column::as_flag)
    }

    /// Numeric channel or an error naming it.
    pub fn require_numeric(&self, name: &str) -> Result<&[Option<f64>], TelemetryError> {
        self.numeric(name).ok_or_else(|| TelemetryError::MissingChannel {
            channel: name.to_string(),
        })
    }

    /// Rows with `start < t < end`.
    pub fn between_exclusive(&self, start: f64, end: f64) -> Self {
        self.select_rows(|t| t > start && t < end)
    }

    /// Rows inside the inclusive range.
    pub fn crop(&self, range: TimeRange) -> Self {
        self.select_rows(|t| range.contains(t))
    }

    fn select_rows<F: Fn(f64) -> bool>(&self, keep: F) -> Self {
        let rows: Vec<usize> = (0..self.index.len()).filter(|&r| keep(self.index[r])).collect();
        Self {
            index: rows.iter().map(|&r| self.index[r]).collect(),
            channels: self
                .channels
                .iter()
                .map(|(name, column)| (name.clone(), column.select(&rows)))
                .collect(),
        }
    }

    pub(crate) fn insert_column(&mut self, name: impl Into<String>, column: Column) {
        debug_assert_eq!(column.len(), self.index.len());
        self.channels.insert(name.into(), column);
    }

    pub(crate) fn numeric_mut(&mut self, name: &str) -> Option<&mut Vec<Option<f64>>> {
        match self.channels.get_mut(name) {
            Some(Column::Numeric(values)) => Some(values),
            _ => None,
        }
    }
}

/// Linear interpolation of `fp` sampled at `xp` onto `x`.
///
/// Outside `xp` the edge sample is held. A query bracketed by a missing
/// sample is missing. `xp` must be increasing.
pub fn interp(x: &[f64], xp: &[f64], fp: &[Option<f64>]) -> Vec<Option<f64>> {
    debug_assert_eq!(xp.len(), fp.len());
    if xp.is_empty() {
        return vec![None; x.len()];
    }
    let last = xp.len() - 1;

    x.iter()
        .map(|&t| {
            if t <= xp[0] {
                return fp[0];
            }
            if t >= xp[last] {
                return fp[last];
            }
            // xp[j] <= t < xp[j + 1]
            let j = xp.partition_point(|&v| v <= t) - 1;
            if t == xp[j] {
                return fp[j];
            }
            match (fp[j], fp[j + 1]) {
                (Some(y0), Some(y1)) => {
                    let slope = (y1 - y0) / (xp[j + 1] - xp[j]);
                    Some(y0 + slope * (t - xp[j]))
                }
                _ => None,
            }
        })
        .collect()
}

/// Carry the last present value forward over gaps. Leading gaps stay missing.
pub fn forward_fill<T: Copy>(values: &mut [Option<T>]) {
    let mut last = None;
    for value in values.iter_mut() {
        match value {
            Some(v) => last = Some(*v),
            None => *value = last,
        }
    }
}

/// Carry the next present value backward over gaps.
pub fn backward_fill<T: Copy>(values: &mut [Option<T>]) {
    let mut next = None;
    for value in values.iter_mut().rev() {
        match value {
            Some(v) => next = Some(*v),
            None => *value = next,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_series() -> TelemetrySeries {
        let mut channels = BTreeMap::new();
        channels.insert(
            "ROVER_X [METERS]".to_string(),
            Column::Numeric(vec![Some(0.0), Some(1.0), None, Some(3.0)]),
        );
        channels.insert(
            "DRIVING".to_string(),
            Column::Flag(vec![Some(true), Some(false), Some(true), None]),
        );
        TelemetrySeries::from_columns(vec![10.0, 11.0, 12.0, 13.0], channels).unwrap()
    }

    #[test]
    fn rejects_unordered_index() {
        let err = TelemetrySeries::from_columns(vec![1.0, 1.0], BTreeMap::new()).unwrap_err();
        assert!(err.to_string().contains("strictly increasing"));
    }

    #[test]
    fn rejects_ragged_columns() {
        let mut channels = BTreeMap::new();
        channels.insert("A".to_string(), Column::Numeric(vec![Some(1.0)]));
        assert!(TelemetrySeries::from_columns(vec![1.0, 2.0], channels).is_err());
    }

    #[test]
    fn crop_and_exclusive_restriction() {
        let series = sample_series();
        let cropped = series.crop(TimeRange::new(11.0, 12.0));
        assert_eq!(cropped.index(), &[11.0, 12.0]);
        assert_eq!(cropped.flag("DRIVING").unwrap(), &[Some(false), Some(true)]);

        let inner = series.between_exclusive(10.0, 13.0);
        assert_eq!(inner.index(), &[11.0, 12.0]);
        assert_eq!(series.span(), Some(TimeRange::new(10.0, 13.0)));
    }

    #[test]
    fn interp_holds_edges_and_propagates_gaps() {
        let xp = [0.0, 1.0, 2.0, 3.0];
        let fp = [Some(0.0), Some(10.0), None, Some(30.0)];
        let out = interp(&[-1.0, 0.5, 1.0, 1.5, 2.5, 4.0], &xp, &fp);
        assert_eq!(out, vec![Some(0.0), Some(5.0), Some(10.0), None, None, Some(30.0)]);
    }

    #[test]
    fn interp_with_no_samples_is_missing() {
        assert_eq!(interp(&[1.0, 2.0], &[], &[]), vec![None, None]);
    }

    #[test]
    fn fills() {
        let mut values = vec![None, Some(1.0), None, None, Some(4.0), None];
        forward_fill(&mut values);
        assert_eq!(values, vec![None, Some(1.0), Some(1.0), Some(1.0), Some(4.0), Some(4.0)]);
        backward_fill(&mut values);
        assert_eq!(values[0], Some(1.0));
    }
}
