//! RKSML state-history reader.
//!
//! An RKSML document is an `RPK_Set` holding one `State_History` whose
//! `Node` children each carry a `Time` attribute and a list of `Knot`
//! values. A knot with a `Units` attribute becomes channel
//! `"{Name} [{Units}]"`; a bare knot is either a `TRUE`/`FALSE` flag or a
//! number.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use rc_types::TelemetryError;
use serde::{Deserialize, Serialize};

use crate::orientation::Quaternion;
use crate::series::{backward_fill, forward_fill, Column, TelemetrySeries, TimeRange};

pub const QUAT_X: &str = "QUAT_X";
pub const QUAT_Y: &str = "QUAT_Y";
pub const QUAT_Z: &str = "QUAT_Z";
pub const QUAT_C: &str = "QUAT_C";

pub const ROLL: &str = "ROLL_FROM_QUAT [RADIANS]";
pub const PITCH: &str = "PITCH_FROM_QUAT [RADIANS]";
pub const YAW: &str = "YAW_FROM_QUAT [RADIANS]";
pub const TILT: &str = "TILT_FROM_QUAT [RADIANS]";

pub const ROVER_X: &str = "ROVER_X [METERS]";
pub const ROVER_Y: &str = "ROVER_Y [METERS]";
pub const ROVER_Z: &str = "ROVER_Z [METERS]";

pub const LF_STEER: &str = "LF_STEER [RADIANS]";
pub const RF_STEER: &str = "RF_STEER [RADIANS]";
pub const RR_STEER: &str = "RR_STEER [RADIANS]";
pub const LR_STEER: &str = "LR_STEER [RADIANS]";

pub const TURN_IN_PLACE_STEERING: &str = "TURN_IN_PLACE_STEERING";
pub const STRAIGHT_STEERING: &str = "STRAIGHT_STEERING";

const RADIANS_SUFFIX: &str = " [RADIANS]";
const DEGREES_SUFFIX: &str = " [DEGREES]";

/// Channels forward- then backward-filled after loading.
pub const FILL_CHANNELS: [&str; 11] = [
    ROVER_X,
    ROVER_Y,
    ROVER_Z,
    "LEFT_BOGIE [RADIANS]",
    "RIGHT_BOGIE [RADIANS]",
    "LEFT_DIFFERENTIAL [RADIANS]",
    "RIGHT_DIFFERENTIAL [RADIANS]",
    LF_STEER,
    RF_STEER,
    RR_STEER,
    LR_STEER,
];

/// Channels summarised over the usable range.
pub const STAT_CHANNELS: [&str; 7] = [
    ROVER_X,
    ROVER_Y,
    ROVER_Z,
    "LEFT_BOGIE [DEGREES]",
    "RIGHT_BOGIE [DEGREES]",
    "LEFT_DIFFERENTIAL [DEGREES]",
    "RIGHT_DIFFERENTIAL [DEGREES]",
];

/// Steering tolerance for driving-mode classification, radians.
pub const STEER_TOLERANCE: f64 = 5e-3;
/// Canonical turn-in-place pose `[LF, RF, RR, LR]`, radians.
pub const TURN_IN_PLACE_POSE: [f64; 4] = [0.840, -0.840, 0.791, -0.791];

/// Leading/trailing dead-telemetry trimming.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CropParams {
    /// How many samples from each end are inspected.
    pub max_hidden_nodes: usize,
    /// A consecutive SCLK gap larger than this marks dead telemetry.
    pub max_sclk_gap: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadOptions {
    pub start: Option<f64>,
    pub end: Option<f64>,
    pub crop: Option<CropParams>,
    /// Parquet cache for parsed documents, see [`crate::load_recorded`].
    pub cache_dir: Option<PathBuf>,
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_start(mut self, start: f64) -> Self {
        self.start = Some(start);
        self
    }

    pub fn with_end(mut self, end: f64) -> Self {
        self.end = Some(end);
        self
    }

    pub fn with_cache_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.cache_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_crop(mut self, max_hidden_nodes: usize, max_sclk_gap: f64) -> Self {
        self.crop = Some(CropParams {
            max_hidden_nodes,
            max_sclk_gap,
        });
        self
    }
}

/// A sample located in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extremum {
    pub sclk: f64,
    pub value: f64,
}

/// Summary of one channel over the usable range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub mean: f64,
    /// The extreme with the larger magnitude.
    pub max_abs: Extremum,
    /// The extreme on the opposite side.
    pub opp_max: Extremum,
}

/// Everything the loader derives from one document.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryLog {
    pub series: TelemetrySeries,
    pub range: TimeRange,
    pub stats: BTreeMap<String, ChannelStats>,
    /// Turn-in-place intervals in time order.
    pub turns: Vec<TimeRange>,
}

impl TelemetryLog {
    /// The series restricted to the usable range.
    pub fn cropped(&self) -> TelemetrySeries {
        self.series.crop(self.range)
    }
}

/// Read and normalise an RKSML document.
pub fn load<P: AsRef<Path>>(path: P, options: &LoadOptions) -> Result<TelemetryLog, TelemetryError> {
    let path = path.as_ref();
    let source = path.display().to_string();
    tracing::info!("Loading RKSML: {}", source);

    let text = fs::read_to_string(path).map_err(|e| TelemetryError::io(source.clone(), e))?;
    let log = parse_str(&text, &source, options)?;

    tracing::info!(
        "Loaded {} nodes, {} channels from {} (usable range {:.3}..{:.3})",
        log.series.len(),
        log.series.channel_names().count(),
        source,
        log.range.start,
        log.range.end
    );
    Ok(log)
}

/// Parse RKSML text. `source` names the document in errors.
pub fn parse_str(text: &str, source: &str, options: &LoadOptions) -> Result<TelemetryLog, TelemetryError> {
    let nodes = read_nodes(text, source, options)?;
    if nodes.is_empty() {
        return Err(TelemetryError::parse(source, "State_History contains no nodes in range"));
    }

    let mut series = build_series(nodes)?;
    derive_orientation(&mut series);
    fill_gaps(&mut series);
    derive_degrees(&mut series);

    let range = usable_range(series.index(), options);
    let stats = channel_stats(&series, range);
    log_excursions(&stats);

    classify_steering(&mut series);
    let turns = turn_intervals(&series);

    Ok(TelemetryLog {
        series,
        range,
        stats,
        turns,
    })
}

// ----------------------------------------------------------------------------
// Document parsing
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum KnotValue {
    Number(f64),
    Flag(bool),
}

#[derive(Debug)]
struct RawNode {
    time: f64,
    knots: Vec<(String, KnotValue)>,
}

#[derive(Debug)]
struct OpenKnot {
    name: String,
    units: Option<String>,
    text: String,
}

fn read_nodes(text: &str, source: &str, options: &LoadOptions) -> Result<Vec<RawNode>, TelemetryError> {
    let start = options.start.unwrap_or(f64::NEG_INFINITY);
    let end = options.end.unwrap_or(f64::INFINITY);

    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut saw_history = false;
    let mut in_history = false;
    // Node currently open and whether it falls inside the bounds.
    let mut node: Option<(RawNode, bool)> = None;
    let mut knot: Option<OpenKnot> = None;

    // A later node with the same timestamp replaces the earlier row.
    let mut by_time: HashMap<u64, usize> = HashMap::new();
    let mut nodes: Vec<RawNode> = Vec::new();

    loop {
        let event = reader.read_event().map_err(|e| {
            TelemetryError::parse(source, format!("at byte {}: {}", reader.error_position(), e))
        })?;

        match event {
            Event::Start(e) => match e.local_name().as_ref() {
                b"State_History" => {
                    saw_history = true;
                    in_history = true;
                }
                b"Node" if in_history => node = Some(open_node(&e, source, start, end)?),
                b"Knot" if node.is_some() => knot = Some(open_knot(&e, source)?),
                _ => {}
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"State_History" => saw_history = true,
                b"Node" if in_history => {
                    let (raw, keep) = open_node(&e, source, start, end)?;
                    if keep {
                        replace_node(&mut nodes, &mut by_time, raw);
                    }
                }
                b"Knot" if node.is_some() => {
                    let open = open_knot(&e, source)?;
                    return Err(TelemetryError::parse(
                        source,
                        format!("knot {} has no value", open.name),
                    ));
                }
                _ => {}
            },
            Event::Text(t) => {
                if let Some(open) = knot.as_mut() {
                    let value = t.unescape().map_err(|e| TelemetryError::parse(source, e.to_string()))?;
                    open.text.push_str(&value);
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"State_History" => in_history = false,
                b"Knot" => {
                    if let (Some(open), Some((raw, keep))) = (knot.take(), node.as_mut()) {
                        if *keep {
                            let value = parse_knot(&open, source)?;
                            raw.knots.push((channel_name(&open), value));
                        }
                    }
                }
                b"Node" => {
                    if let Some((raw, keep)) = node.take() {
                        if keep {
                            replace_node(&mut nodes, &mut by_time, raw);
                        }
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_history {
        return Err(TelemetryError::parse(source, "document has no State_History element"));
    }
    Ok(nodes)
}

fn attribute(e: &BytesStart<'_>, name: &str, source: &str) -> Result<Option<String>, TelemetryError> {
    for attr in e.attributes() {
        let attr = attr.map_err(|err| TelemetryError::parse(source, err.to_string()))?;
        if attr.key.local_name().as_ref() == name.as_bytes() {
            let value = attr
                .unescape_value()
                .map_err(|err| TelemetryError::parse(source, err.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn open_node(e: &BytesStart<'_>, source: &str, start: f64, end: f64) -> Result<(RawNode, bool), TelemetryError> {
    let time_text = attribute(e, "Time", source)?
        .ok_or_else(|| TelemetryError::parse(source, "Node without Time attribute"))?;
    let time = parse_time(&time_text, source)?;
    let keep = time >= start && time <= end;
    Ok((
        RawNode {
            time,
            knots: Vec::new(),
        },
        keep,
    ))
}

fn replace_node(nodes: &mut Vec<RawNode>, by_time: &mut HashMap<u64, usize>, raw: RawNode) {
    let key = raw.time.to_bits();
    match by_time.get(&key) {
        Some(&slot) => nodes[slot] = raw,
        None => {
            by_time.insert(key, nodes.len());
            nodes.push(raw);
        }
    }
}

fn open_knot(e: &BytesStart<'_>, source: &str) -> Result<OpenKnot, TelemetryError> {
    let name = attribute(e, "Name", source)?
        .ok_or_else(|| TelemetryError::parse(source, "Knot without Name attribute"))?;
    Ok(OpenKnot {
        name,
        units: attribute(e, "Units", source)?,
        text: String::new(),
    })
}

fn parse_time(text: &str, source: &str) -> Result<f64, TelemetryError> {
    match text.trim().parse::<f64>() {
        Ok(t) if t.is_finite() => Ok(t),
        _ => Err(TelemetryError::parse(source, format!("malformed Time attribute {text:?}"))),
    }
}

fn channel_name(knot: &OpenKnot) -> String {
    match &knot.units {
        Some(units) => format!("{} [{}]", knot.name, units),
        None => knot.name.clone(),
    }
}

fn parse_knot(knot: &OpenKnot, source: &str) -> Result<KnotValue, TelemetryError> {
    let text = knot.text.trim();
    if knot.units.is_none() {
        match text {
            "TRUE" => return Ok(KnotValue::Flag(true)),
            "FALSE" => return Ok(KnotValue::Flag(false)),
            _ => {}
        }
    }
    text.parse::<f64>().map(KnotValue::Number).map_err(|_| {
        TelemetryError::parse(source, format!("knot {} has non-numeric value {:?}", knot.name, text))
    })
}

fn build_series(mut nodes: Vec<RawNode>) -> Result<TelemetrySeries, TelemetryError> {
    nodes.sort_by(|a, b| a.time.total_cmp(&b.time));
    let rows = nodes.len();

    let mut channels: BTreeMap<String, Column> = BTreeMap::new();
    for (row, node) in nodes.iter().enumerate() {
        for (name, value) in &node.knots {
            let column = channels.entry(name.clone()).or_insert_with(|| match value {
                KnotValue::Number(_) => Column::Numeric(vec![None; rows]),
                KnotValue::Flag(_) => Column::Flag(vec![None; rows]),
            });
            match (column, value) {
                (Column::Numeric(values), KnotValue::Number(v)) => values[row] = Some(*v),
                (Column::Flag(values), KnotValue::Flag(v)) => values[row] = Some(*v),
                _ => {
                    return Err(TelemetryError::MixedChannel {
                        channel: name.clone(),
                    })
                }
            }
        }
    }

    let index = nodes.iter().map(|n| n.time).collect();
    TelemetrySeries::from_columns(index, channels)
}

// ----------------------------------------------------------------------------
// Derived channels
// ----------------------------------------------------------------------------

fn derive_orientation(series: &mut TelemetrySeries) {
    let (Some(qx), Some(qy), Some(qz), Some(qc)) = (
        series.numeric(QUAT_X),
        series.numeric(QUAT_Y),
        series.numeric(QUAT_Z),
        series.numeric(QUAT_C),
    ) else {
        tracing::debug!("Quaternion channels incomplete, skipping derived orientation");
        return;
    };

    let n = series.len();
    let mut roll = Vec::with_capacity(n);
    let mut pitch = Vec::with_capacity(n);
    let mut yaw = Vec::with_capacity(n);
    let mut tilt = Vec::with_capacity(n);
    for row in 0..n {
        match Quaternion::from_options(qx[row], qy[row], qz[row], qc[row]) {
            Some(q) => {
                let angles = q.rover_euler();
                roll.push(Some(angles.roll));
                pitch.push(Some(angles.pitch));
                yaw.push(Some(angles.yaw));
                tilt.push(Some(angles.tilt()));
            }
            None => {
                roll.push(None);
                pitch.push(None);
                yaw.push(None);
                tilt.push(None);
            }
        }
    }

    series.insert_column(ROLL, Column::Numeric(roll));
    series.insert_column(PITCH, Column::Numeric(pitch));
    series.insert_column(YAW, Column::Numeric(yaw));
    series.insert_column(TILT, Column::Numeric(tilt));
}

fn fill_gaps(series: &mut TelemetrySeries) {
    for name in FILL_CHANNELS {
        if let Some(values) = series.numeric_mut(name) {
            forward_fill(values);
            backward_fill(values);
        }
    }
}

/// Companion degree channel for a radian channel name.
pub fn degrees_name(radians_name: &str) -> String {
    let base = radians_name.split(' ').next().unwrap_or(radians_name);
    format!("{base}{DEGREES_SUFFIX}")
}

fn derive_degrees(series: &mut TelemetrySeries) {
    let derived: Vec<(String, Vec<Option<f64>>)> = series
        .channels()
        .filter(|(name, _)| name.ends_with(RADIANS_SUFFIX))
        .filter_map(|(name, column)| {
            column
                .as_numeric()
                .map(|values| (degrees_name(name), values.iter().map(|v| v.map(f64::to_degrees)).collect()))
        })
        .collect();

    for (name, values) in derived {
        series.insert_column(name, Column::Numeric(values));
    }
}

// ----------------------------------------------------------------------------
// Range and statistics
// ----------------------------------------------------------------------------

/// Usable range: explicit bounds win, otherwise crop dead telemetry at the
/// ends. Only the first and last `max_hidden_nodes` samples are inspected.
pub fn usable_range(index: &[f64], options: &LoadOptions) -> TimeRange {
    let (Some(&first), Some(&last)) = (index.first(), index.last()) else {
        return TimeRange::new(f64::NAN, f64::NAN);
    };
    let mut range = TimeRange::new(first, last);
    let n = index.len();

    match options.start {
        Some(start) => range.start = start,
        None => {
            if let Some(crop) = options.crop {
                for idx in 1..crop.max_hidden_nodes.min(n) {
                    if index[idx] - index[idx - 1] > crop.max_sclk_gap {
                        range.start = index[idx];
                    }
                }
            }
        }
    }

    match options.end {
        Some(end) => range.end = end,
        None => {
            if let Some(crop) = options.crop {
                for k in 1..crop.max_hidden_nodes.min(n) {
                    let i = n - k;
                    if index[i] - index[i - 1] > crop.max_sclk_gap {
                        range.end = index[i - 1];
                    }
                }
            }
        }
    }

    range
}

fn channel_stats(series: &TelemetrySeries, range: TimeRange) -> BTreeMap<String, ChannelStats> {
    let mut stats = BTreeMap::new();
    for name in STAT_CHANNELS {
        let Some(values) = series.numeric(name) else {
            continue;
        };
        let samples: Vec<(f64, f64)> = series
            .index()
            .iter()
            .zip(values)
            .filter(|(t, _)| range.contains(**t))
            .filter_map(|(t, v)| v.map(|v| (*t, v)))
            .collect();
        if let Some(summary) = summarize(&samples) {
            stats.insert(name.to_string(), summary);
        }
    }
    stats
}

fn summarize(samples: &[(f64, f64)]) -> Option<ChannelStats> {
    let (&first, rest) = samples.split_first()?;
    let mut max = first;
    let mut min = first;
    let mut sum = first.1;
    for &(t, v) in rest {
        // First occurrence wins on ties.
        if v > max.1 {
            max = (t, v);
        }
        if v < min.1 {
            min = (t, v);
        }
        sum += v;
    }

    let max = Extremum { sclk: max.0, value: max.1 };
    let min = Extremum { sclk: min.0, value: min.1 };
    let (max_abs, opp_max) = if max.value.abs() > min.value.abs() {
        (max, min)
    } else {
        (min, max)
    };
    Some(ChannelStats {
        mean: sum / samples.len() as f64,
        max_abs,
        opp_max,
    })
}

fn log_excursions(stats: &BTreeMap<String, ChannelStats>) {
    for name in &STAT_CHANNELS[3..] {
        if let Some(s) = stats.get(*name) {
            tracing::info!(
                "{}: max abs {:.3} at {:.3}, opposite {:.3} at {:.3}",
                name,
                s.max_abs.value,
                s.max_abs.sclk,
                s.opp_max.value,
                s.opp_max.sclk
            );
        }
    }
}

// ----------------------------------------------------------------------------
// Driving mode
// ----------------------------------------------------------------------------

fn classify_steering(series: &mut TelemetrySeries) {
    let n = series.len();
    let steer: Vec<Option<&[Option<f64>]>> = [LF_STEER, RF_STEER, RR_STEER, LR_STEER]
        .iter()
        .map(|name| series.numeric(name))
        .collect();
    if steer.iter().any(Option::is_none) {
        tracing::debug!("Steering channels incomplete, driving mode is never set");
    }

    let matches_pose = |row: usize, pose: [f64; 4]| -> bool {
        steer.iter().zip(pose).all(|(channel, target)| {
            channel
                .and_then(|values| values[row])
                .is_some_and(|v| (v - target).abs() < STEER_TOLERANCE)
        })
    };

    let turn: Vec<Option<bool>> = (0..n).map(|r| Some(matches_pose(r, TURN_IN_PLACE_POSE))).collect();
    let straight: Vec<Option<bool>> = (0..n).map(|r| Some(matches_pose(r, [0.0; 4]))).collect();

    series.insert_column(TURN_IN_PLACE_STEERING, Column::Flag(turn));
    series.insert_column(STRAIGHT_STEERING, Column::Flag(straight));
}

/// Collapse contiguous turn-in-place runs into intervals. A run ends at the
/// first sample that is no longer turning, or at the last sample.
fn turn_intervals(series: &TelemetrySeries) -> Vec<TimeRange> {
    let Some(flags) = series.flag(TURN_IN_PLACE_STEERING) else {
        return Vec::new();
    };

    let mut turns = Vec::new();
    let mut open: Option<f64> = None;
    for (&sclk, flag) in series.index().iter().zip(flags) {
        let turning = flag.unwrap_or(false);
        match (turning, open) {
            (true, None) => open = Some(sclk),
            (false, Some(start)) => {
                turns.push(TimeRange::new(start, sclk));
                open = None;
            }
            _ => {}
        }
    }
    if let (Some(start), Some(&last)) = (open, series.index().last()) {
        turns.push(TimeRange::new(start, last));
    }
    turns
}
