//! Row-oriented table the simulator writes for each sub-trial.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use rc_types::TelemetryError;

pub const CLOCK: &str = "m_clock";
pub const X: &str = "x";
pub const Y: &str = "y";
pub const Z: &str = "z";
pub const QX: &str = "q_x";
pub const QY: &str = "q_y";
pub const QZ: &str = "q_z";
pub const QW: &str = "q_w";
pub const SLIP: &str = "slip";
pub const LEFT_DIFFERENTIAL: &str = "lb_rot";
pub const RIGHT_DIFFERENTIAL: &str = "rb_rot";

/// Simulator output, one entry per row that carries a clock value.
///
/// Cells that are empty, `nan`, or unparsable are missing. Rows cut short
/// by an interrupted write keep whatever leading fields they have.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulatorTable {
    clock: Vec<f64>,
    columns: BTreeMap<String, Vec<Option<f64>>>,
}

impl SimulatorTable {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, TelemetryError> {
        let path = path.as_ref();
        let source = path.display().to_string();
        let file = File::open(path).map_err(|e| TelemetryError::io(source.clone(), e))?;
        let table = Self::from_reader(file, &source)?;
        tracing::debug!("Read {} simulator rows from {}", table.len(), source);
        Ok(table)
    }

    pub fn from_reader<R: Read>(reader: R, source: &str) -> Result<Self, TelemetryError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);

        let headers: Vec<String> = csv_reader
            .headers()
            .map_err(|e| TelemetryError::parse(source, e.to_string()))?
            .iter()
            .map(str::to_string)
            .collect();
        let clock_at = headers
            .iter()
            .position(|h| h == CLOCK)
            .ok_or_else(|| TelemetryError::MissingChannel {
                channel: CLOCK.to_string(),
            })?;

        let mut clock = Vec::new();
        let mut columns: BTreeMap<String, Vec<Option<f64>>> = headers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != clock_at)
            .map(|(_, h)| (h.clone(), Vec::new()))
            .collect();

        for record in csv_reader.records() {
            let record = record.map_err(|e| TelemetryError::parse(source, e.to_string()))?;
            let Some(t) = record.get(clock_at).and_then(parse_cell) else {
                continue;
            };
            clock.push(t);
            for (i, header) in headers.iter().enumerate() {
                if i == clock_at {
                    continue;
                }
                if let Some(values) = columns.get_mut(header) {
                    values.push(record.get(i).and_then(parse_cell));
                }
            }
        }

        Ok(Self { clock, columns })
    }

    pub fn len(&self) -> usize {
        self.clock.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clock.is_empty()
    }

    pub fn clock(&self) -> &[f64] {
        &self.clock
    }

    pub fn column(&self, name: &str) -> Option<&[Option<f64>]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }
}

fn parse_cell(cell: &str) -> Option<f64> {
    cell.parse::<f64>().ok().filter(|v| !v.is_nan())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "m_clock, x, y, z, q_x, q_y, q_z, q_w, slip, lb_rot, rb_rot\n";

    #[test]
    fn reads_padded_rows_with_nan() {
        let text = format!(
            "{HEADER}0.0, 1.0, 2.0, 3.0, 0, 0, 0, 1, nan, 0.1, -0.1\n0.5, 1.5, 2.0, 3.0, 0, 0, 0, 1, 0.2, 0.1, -0.1\n"
        );
        let table = SimulatorTable::from_reader(text.as_bytes(), "out.csv").unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.clock(), &[0.0, 0.5]);
        assert_eq!(table.column(X).unwrap(), &[Some(1.0), Some(1.5)]);
        assert_eq!(table.column(SLIP).unwrap(), &[None, Some(0.2)]);
        assert!(table.column("m_clock").is_none());
    }

    #[test]
    fn truncated_tail_is_tolerated() {
        let text = format!("{HEADER}0.0, 1.0, 2.0, 3.0, 0, 0, 0, 1, 0, 0, 0\n0.5, 1.5, 2.");
        let table = SimulatorTable::from_reader(text.as_bytes(), "out.csv").unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.column(Y).unwrap(), &[Some(2.0), Some(2.0)]);
        assert_eq!(table.column(Z).unwrap(), &[Some(3.0), None]);
    }

    #[test]
    fn header_only_table_is_empty() {
        let table = SimulatorTable::from_reader(HEADER.as_bytes(), "out.csv").unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn missing_clock_column() {
        let err = SimulatorTable::from_reader("x,y\n1,2\n".as_bytes(), "out.csv").unwrap_err();
        assert!(matches!(err, TelemetryError::MissingChannel { .. }));
    }
}
