//! Combined-telemetry corpus: the CSV form of a recorded drive that the
//! scorer compares against, and the builder that produces it.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use rc_types::TelemetryError;

use crate::rksml::{self, LoadOptions, TelemetryLog};
use crate::series::{backward_fill, forward_fill, interp, Column, TelemetrySeries, SCLK};

pub const SCLK_REL: &str = "SCLK_REL";
pub const SLIP: &str = "SLIP";
pub const LEFT_DIFFERENTIAL: &str = "LEFT_DIFFERENTIAL";
pub const RIGHT_DIFFERENTIAL: &str = "RIGHT_DIFFERENTIAL";
pub const LM_DRIVE_ANG_VEL: &str = "LM_DRIVE_ANG_VEL";
pub const RM_DRIVE_ANG_VEL: &str = "RM_DRIVE_ANG_VEL";

/// Slip file columns.
pub const SLIP_SCLK: &str = "#sclk0_0";
pub const SLIP_FRACTION: &str = "fast_slip_frac";

/// Wheel telemetry channel id and the corpus column it becomes (negated).
pub const WHEEL_CHANNELS: [(&str, &str); 12] = [
    ("DRIVE_LF_angle", "LF_DRIVE"),
    ("DRIVE_LM_angle", "LM_DRIVE"),
    ("DRIVE_LR_angle", "LR_DRIVE"),
    ("DRIVE_RF_angle", "RF_DRIVE"),
    ("DRIVE_RM_angle", "RM_DRIVE"),
    ("DRIVE_RR_angle", "RR_DRIVE"),
    ("SYS_MOB_diff_l", LEFT_DIFFERENTIAL),
    ("SYS_MOB_diff_r", RIGHT_DIFFERENTIAL),
    ("STEER_LF_angle", rksml::LF_STEER),
    ("STEER_LR_angle", rksml::LR_STEER),
    ("STEER_RF_angle", rksml::RF_STEER),
    ("STEER_RR_angle", rksml::RR_STEER),
];

/// Column order of an exported corpus, after `SCLK`.
pub const CORPUS_COLUMNS: [&str; 23] = [
    SCLK_REL,
    rksml::ROVER_X,
    rksml::ROVER_Y,
    rksml::ROVER_Z,
    rksml::QUAT_X,
    rksml::QUAT_Y,
    rksml::QUAT_Z,
    rksml::QUAT_C,
    "LF_DRIVE",
    "LM_DRIVE",
    "LR_DRIVE",
    "RF_DRIVE",
    "RM_DRIVE",
    "RR_DRIVE",
    rksml::LF_STEER,
    rksml::LR_STEER,
    rksml::RF_STEER,
    rksml::RR_STEER,
    SLIP,
    LM_DRIVE_ANG_VEL,
    RM_DRIVE_ANG_VEL,
    LEFT_DIFFERENTIAL,
    RIGHT_DIFFERENTIAL,
];

impl TelemetrySeries {
    /// Read a combined-telemetry CSV indexed by its `SCLK` column.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self, TelemetryError> {
        let path = path.as_ref();
        let source = path.display().to_string();
        tracing::info!("Loading telemetry corpus: {}", source);
        let file = File::open(path).map_err(|e| TelemetryError::io(source.clone(), e))?;
        Self::from_csv_reader(file, &source)
    }

    pub fn from_csv_reader<R: Read>(reader: R, source: &str) -> Result<Self, TelemetryError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers: Vec<String> = csv_reader
            .headers()
            .map_err(|e| TelemetryError::parse(source, e.to_string()))?
            .iter()
            .map(str::to_string)
            .collect();
        let sclk_at = headers
            .iter()
            .position(|h| h == SCLK)
            .ok_or_else(|| TelemetryError::MissingChannel {
                channel: SCLK.to_string(),
            })?;

        let mut rows: Vec<(f64, csv::StringRecord)> = Vec::new();
        for record in csv_reader.records() {
            let record = record.map_err(|e| TelemetryError::parse(source, e.to_string()))?;
            let cell = record.get(sclk_at).unwrap_or_default();
            let sclk = cell
                .parse::<f64>()
                .ok()
                .filter(|t| t.is_finite())
                .ok_or_else(|| TelemetryError::parse(source, format!("malformed SCLK {cell:?}")))?;
            rows.push((sclk, record));
        }
        rows.sort_by(|a, b| a.0.total_cmp(&b.0));
        rows.dedup_by(|later, earlier| later.0 == earlier.0);

        let mut channels = BTreeMap::new();
        for (i, header) in headers.iter().enumerate() {
            if i == sclk_at {
                continue;
            }
            let cells: Vec<&str> = rows.iter().map(|(_, r)| r.get(i).unwrap_or_default()).collect();
            channels.insert(header.clone(), parse_column(header, &cells, source)?);
        }

        let index = rows.iter().map(|(t, _)| *t).collect();
        Self::from_columns(index, channels)
    }

    /// Write the series as CSV with `SCLK` first and columns in `order`.
    /// Channels not in `order` are omitted; names in `order` the series
    /// lacks are written empty.
    pub fn write_csv<W: Write>(&self, writer: W, order: &[&str]) -> Result<(), TelemetryError> {
        let to_err = |e: csv::Error| TelemetryError::parse("csv output", e.to_string());
        let mut out = csv::Writer::from_writer(writer);

        let mut header = vec![SCLK];
        header.extend_from_slice(order);
        out.write_record(&header).map_err(to_err)?;

        for (row, sclk) in self.index().iter().enumerate() {
            let mut record = vec![format_value(*sclk)];
            for name in order {
                record.push(match self.channel(name) {
                    Some(Column::Numeric(values)) => values[row].map(format_value).unwrap_or_default(),
                    Some(Column::Flag(values)) => values[row]
                        .map(|v| if v { "True" } else { "False" }.to_string())
                        .unwrap_or_default(),
                    None => String::new(),
                });
            }
            out.write_record(&record).map_err(to_err)?;
        }
        out.flush().map_err(|e| TelemetryError::io("csv output", e))?;
        Ok(())
    }
}

fn format_value(value: f64) -> String {
    format!("{value}")
}

fn parse_flag(cell: &str) -> Option<bool> {
    match cell {
        "TRUE" | "True" | "true" => Some(true),
        "FALSE" | "False" | "false" => Some(false),
        _ => None,
    }
}

fn parse_column(name: &str, cells: &[&str], source: &str) -> Result<Column, TelemetryError> {
    let present = || cells.iter().filter(|c| !c.is_empty());
    let all_flags = present().next().is_some() && present().all(|c| parse_flag(c).is_some());
    if all_flags {
        return Ok(Column::Flag(cells.iter().map(|c| parse_flag(c)).collect()));
    }

    let mut values = Vec::with_capacity(cells.len());
    for cell in cells {
        if cell.is_empty() {
            values.push(None);
            continue;
        }
        let v = cell.parse::<f64>().map_err(|_| {
            TelemetryError::parse(source, format!("column {name} has non-numeric value {cell:?}"))
        })?;
        values.push(if v.is_nan() { None } else { Some(v) });
    }
    Ok(Column::Numeric(values))
}

// ----------------------------------------------------------------------------
// Corpus builder
// ----------------------------------------------------------------------------

/// Builds a combined-telemetry corpus from an RKSML playback, a slip
/// estimate file and long-format wheel telemetry.
#[derive(Debug, Clone, Default)]
pub struct CorpusBuilder {
    options: LoadOptions,
}

/// Sample series keyed by wheel telemetry channel id.
type WheelSamples = HashMap<String, (Vec<f64>, Vec<Option<f64>>)>;

impl CorpusBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_load_options(mut self, options: LoadOptions) -> Self {
        self.options = options;
        self
    }

    /// Load all three inputs and produce the corpus series.
    pub fn build<P, Q, R>(&self, rksml_path: P, slip_path: Q, wheel_path: R) -> Result<TelemetrySeries, TelemetryError>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
        R: AsRef<Path>,
    {
        let log = rksml::load(rksml_path, &self.options)?;
        let (slip_sclk, slip) = read_slip(slip_path.as_ref())?;
        let wheels = read_wheel_telemetry(wheel_path.as_ref())?;
        self.assemble(&log, &slip_sclk, &slip, &wheels)
    }

    /// Build and write the corpus CSV to `dest`.
    pub fn write<P, Q, R, D>(&self, rksml_path: P, slip_path: Q, wheel_path: R, dest: D) -> Result<TelemetrySeries, TelemetryError>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
        R: AsRef<Path>,
        D: AsRef<Path>,
    {
        let series = self.build(rksml_path, slip_path, wheel_path)?;
        let dest = dest.as_ref();
        let file = File::create(dest).map_err(|e| TelemetryError::io(dest.display().to_string(), e))?;
        series.write_csv(file, &CORPUS_COLUMNS)?;
        tracing::info!("Wrote corpus with {} rows to {}", series.len(), dest.display());
        Ok(series)
    }

    fn assemble(
        &self,
        log: &TelemetryLog,
        slip_sclk: &[f64],
        slip: &[Option<f64>],
        wheels: &WheelSamples,
    ) -> Result<TelemetrySeries, TelemetryError> {
        let cropped = log.series.between_exclusive(log.range.start, log.range.end);
        if cropped.is_empty() {
            return Err(TelemetryError::parse(
                "corpus",
                format!("no telemetry strictly inside {:.3}..{:.3}", log.range.start, log.range.end),
            ));
        }
        let sclk = cropped.index().to_vec();
        tracing::info!("Starting SCLK: {} to {}", sclk[0], sclk[sclk.len() - 1]);

        let mut columns: BTreeMap<String, Column> = BTreeMap::new();
        for name in [
            rksml::TURN_IN_PLACE_STEERING,
            rksml::STRAIGHT_STEERING,
            rksml::ROVER_X,
            rksml::ROVER_Y,
            rksml::ROVER_Z,
            rksml::QUAT_X,
            rksml::QUAT_Y,
            rksml::QUAT_Z,
            rksml::QUAT_C,
        ] {
            let column = cropped.channel(name).ok_or_else(|| TelemetryError::MissingChannel {
                channel: name.to_string(),
            })?;
            columns.insert(name.to_string(), column.clone());
        }

        columns.insert(SLIP.to_string(), Column::Numeric(interp(&sclk, slip_sclk, slip)));

        for (channel_id, column) in WHEEL_CHANNELS {
            let (xp, fp) = wheels.get(channel_id).ok_or_else(|| TelemetryError::MissingChannel {
                channel: channel_id.to_string(),
            })?;
            let values = interp(&sclk, xp, fp).into_iter().map(|v| v.map(|v| -v)).collect();
            columns.insert(column.to_string(), Column::Numeric(values));
        }

        for (drive, rate) in [("LM_DRIVE", LM_DRIVE_ANG_VEL), ("RM_DRIVE", RM_DRIVE_ANG_VEL)] {
            let values = match &columns[drive] {
                Column::Numeric(values) => finite_difference(&sclk, values),
                Column::Flag(_) => vec![None; sclk.len()],
            };
            columns.insert(rate.to_string(), Column::Numeric(values));
        }

        let t0 = sclk[0];
        columns.insert(
            SCLK_REL.to_string(),
            Column::Numeric(sclk.iter().map(|t| Some(t - t0)).collect()),
        );

        for column in columns.values_mut() {
            match column {
                Column::Numeric(values) => {
                    backward_fill(values);
                    forward_fill(values);
                }
                Column::Flag(values) => {
                    backward_fill(values);
                    forward_fill(values);
                }
            }
        }

        TelemetrySeries::from_columns(sclk, columns)
    }
}

fn finite_difference(sclk: &[f64], values: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut rates = vec![None; values.len()];
    for i in 1..values.len() {
        if let (Some(a), Some(b)) = (values[i - 1], values[i]) {
            rates[i] = Some((b - a) / (sclk[i] - sclk[i - 1]));
        }
    }
    rates
}

fn read_slip(path: &Path) -> Result<(Vec<f64>, Vec<Option<f64>>), TelemetryError> {
    let source = path.display().to_string();
    let file = File::open(path).map_err(|e| TelemetryError::io(source.clone(), e))?;
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(file);

    let headers = reader
        .headers()
        .map_err(|e| TelemetryError::parse(source.as_str(), e.to_string()))?
        .clone();
    let position = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| TelemetryError::MissingChannel {
                channel: name.to_string(),
            })
    };
    let (t_at, v_at) = (position(SLIP_SCLK)?, position(SLIP_FRACTION)?);

    let mut samples = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| TelemetryError::parse(source.as_str(), e.to_string()))?;
        let Some(t) = record.get(t_at).and_then(|c| c.parse::<f64>().ok()) else {
            continue;
        };
        let v = record
            .get(v_at)
            .and_then(|c| c.parse::<f64>().ok())
            .filter(|v| !v.is_nan());
        samples.push((t, v));
    }
    samples.sort_by(|a, b| a.0.total_cmp(&b.0));
    Ok(samples.into_iter().unzip())
}

fn read_wheel_telemetry(path: &Path) -> Result<WheelSamples, TelemetryError> {
    let source = path.display().to_string();
    let file = File::open(path).map_err(|e| TelemetryError::io(source.clone(), e))?;
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(file);

    let headers = reader
        .headers()
        .map_err(|e| TelemetryError::parse(source.as_str(), e.to_string()))?
        .clone();
    let position = |name: &str| {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| TelemetryError::MissingChannel {
                channel: name.to_string(),
            })
    };
    let (t_at, id_at, y_at) = (position("sclk")?, position("channel_id")?, position("y")?);

    let mut grouped: HashMap<String, Vec<(f64, Option<f64>)>> = HashMap::new();
    for record in reader.records() {
        let record = record.map_err(|e| TelemetryError::parse(source.as_str(), e.to_string()))?;
        let (Some(t), Some(id)) = (record.get(t_at).and_then(|c| c.parse::<f64>().ok()), record.get(id_at)) else {
            continue;
        };
        let y = record
            .get(y_at)
            .and_then(|c| c.parse::<f64>().ok())
            .filter(|v| !v.is_nan());
        grouped.entry(id.to_string()).or_default().push((t, y));
    }

    Ok(grouped
        .into_iter()
        .map(|(id, mut samples)| {
            samples.sort_by(|a, b| a.0.total_cmp(&b.0));
            (id, samples.into_iter().unzip())
        })
        .collect())
}
