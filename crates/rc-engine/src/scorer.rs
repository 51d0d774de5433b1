// Trial scorer - compares one simulated run against recorded telemetry
// The simulator clock is the common time grid; recorded channels are
// interpolated onto it before differencing.

use rc_data::corpus::{LEFT_DIFFERENTIAL, RIGHT_DIFFERENTIAL, SLIP};
use rc_data::rksml::{QUAT_C, QUAT_X, QUAT_Y, QUAT_Z, ROVER_X, ROVER_Y, ROVER_Z};
use rc_data::series::forward_fill;
use rc_data::{interp, sim_table, Quaternion, SimulatorTable, TelemetrySeries};
use rc_types::{Residuals, ScoreError, TrialResult, DIFFERENTIAL_WEIGHT};
use std::path::Path;
use tracing::{debug, warn};

/// Fewer simulated rows than this cannot be scored.
pub const MIN_SIMULATED_ROWS: usize = 3;

const POSITION_PAIRS: [(&str, &str); 3] = [
    (ROVER_X, sim_table::X),
    (ROVER_Y, sim_table::Y),
    (ROVER_Z, sim_table::Z),
];

const DIFFERENTIAL_PAIRS: [(&str, &str); 2] = [
    (LEFT_DIFFERENTIAL, sim_table::LEFT_DIFFERENTIAL),
    (RIGHT_DIFFERENTIAL, sim_table::RIGHT_DIFFERENTIAL),
];

/// Score the simulator output file at `output`.
///
/// An output file that is missing or cannot be parsed is insufficient data,
/// not an error: a simulator that died early leaves exactly that behind.
pub fn score_file(recorded: &TelemetrySeries, output: &Path) -> Result<TrialResult, ScoreError> {
    match SimulatorTable::from_path(output) {
        Ok(table) => score(recorded, &table),
        Err(e) => {
            warn!("Unable to read simulator output {}: {}", output.display(), e);
            Ok(TrialResult::InsufficientData)
        }
    }
}

/// Compare a simulated table against recorded telemetry.
pub fn score(recorded: &TelemetrySeries, simulated: &SimulatorTable) -> Result<TrialResult, ScoreError> {
    if simulated.len() < MIN_SIMULATED_ROWS {
        debug!("Simulator produced {} rows, need {}", simulated.len(), MIN_SIMULATED_ROWS);
        return Ok(TrialResult::InsufficientData);
    }

    let clock = simulated.clock();
    let start = clock[0];
    let end = clock[clock.len() - 1];
    let window = recorded_window(recorded, start, end)?;

    let residual = position_residual(&window, simulated)?;
    let slip_residual = slip_residual(&window, simulated);
    let rot_residual = rotation_residual(&window, simulated);
    let diff_residual = differential_residual(&window, simulated);

    let residuals = Residuals::new(residual, slip_residual, rot_residual, diff_residual, end);
    debug!(
        "Scored {} rows: residual={} slip={} rot={} diff={}",
        clock.len(),
        residuals.residual,
        residuals.slip_residual,
        residuals.rot_residual,
        residuals.diff_residual
    );
    Ok(TrialResult::Ok(residuals))
}

/// Recorded rows strictly inside the simulated span, or every row when
/// none fall inside.
fn recorded_window(recorded: &TelemetrySeries, start: f64, end: f64) -> Result<TelemetrySeries, ScoreError> {
    let inside = recorded.between_exclusive(start, end);
    if !inside.is_empty() {
        return Ok(inside);
    }
    if recorded.is_empty() {
        return Err(ScoreError::NoRecordedData);
    }
    warn!(
        "No recorded telemetry inside simulated range {} to {}; check t_init against the recorded SCLK bounds",
        start, end
    );
    Ok(recorded.clone())
}

// ----------------------------------------------------------------------------
// Residual terms
// ----------------------------------------------------------------------------

fn position_residual(window: &TelemetrySeries, simulated: &SimulatorTable) -> Result<f64, ScoreError> {
    let mut total = None;
    for (recorded_name, simulated_name) in POSITION_PAIRS {
        let recorded = window
            .numeric(recorded_name)
            .ok_or_else(|| ScoreError::MissingRecordedChannel {
                channel: recorded_name.to_string(),
            })?;
        let simulated_values = simulated
            .column(simulated_name)
            .ok_or_else(|| ScoreError::MissingSimulatedColumn {
                column: simulated_name.to_string(),
            })?;
        let on_grid = interp(simulated.clock(), window.index(), recorded);
        if let Some(sse) = sum_squared(&on_grid, simulated_values) {
            total = Some(total.unwrap_or(0.0) + sse);
        }
    }
    Ok(total.unwrap_or(f64::NAN))
}

fn slip_residual(window: &TelemetrySeries, simulated: &SimulatorTable) -> f64 {
    let (Some(recorded), Some(simulated_values)) = (
        lookup(window, SLIP),
        simulated.column(sim_table::SLIP),
    ) else {
        warn!("Slip channel missing, slip residual undefined");
        return f64::NAN;
    };

    let mut filled = recorded.to_vec();
    forward_fill(&mut filled);
    let on_grid = interp(simulated.clock(), window.index(), &filled);
    mean_absolute(&on_grid, simulated_values).unwrap_or(f64::NAN)
}

fn rotation_residual(window: &TelemetrySeries, simulated: &SimulatorTable) -> f64 {
    let recorded_quats = [QUAT_X, QUAT_Y, QUAT_Z, QUAT_C].map(|name| window.numeric(name));
    let simulated_quats = [sim_table::QX, sim_table::QY, sim_table::QZ, sim_table::QW].map(|name| simulated.column(name));
    let ([Some(rx), Some(ry), Some(rz), Some(rw)], [Some(sx), Some(sy), Some(sz), Some(sw)]) =
        (recorded_quats, simulated_quats)
    else {
        warn!("Quaternion channels missing, rotation residual undefined");
        return f64::NAN;
    };

    let recorded_euler = euler_degrees(rx, ry, rz, rw);
    let simulated_euler = euler_degrees(sx, sy, sz, sw);

    let per_axis: Vec<f64> = (0..3)
        .filter_map(|axis| {
            let on_grid = interp(simulated.clock(), window.index(), &recorded_euler[axis]);
            mean_absolute(&on_grid, &simulated_euler[axis])
        })
        .collect();
    if per_axis.is_empty() {
        return f64::NAN;
    }
    per_axis.iter().sum::<f64>() / per_axis.len() as f64
}

fn differential_residual(window: &TelemetrySeries, simulated: &SimulatorTable) -> f64 {
    let mut total = None;
    for (recorded_name, simulated_name) in DIFFERENTIAL_PAIRS {
        let (Some(recorded), Some(simulated_values)) = (lookup(window, recorded_name), simulated.column(simulated_name))
        else {
            warn!("Differential channel {} missing, differential residual undefined", recorded_name);
            return f64::NAN;
        };
        let on_grid = interp(simulated.clock(), window.index(), recorded);
        if let Some(sse) = sum_squared(&on_grid, simulated_values) {
            total = Some(total.unwrap_or(0.0) + sse);
        }
    }
    total.map_or(f64::NAN, |sse| DIFFERENTIAL_WEIGHT * sse)
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

/// Corpus columns carry bare names; loader output carries a unit suffix.
fn lookup<'a>(window: &'a TelemetrySeries, name: &str) -> Option<&'a [Option<f64>]> {
    window
        .numeric(name)
        .or_else(|| window.numeric(&format!("{name} [RADIANS]")))
}

/// Intrinsic X-Y-Z Euler angles in degrees, one vector per axis.
fn euler_degrees(
    x: &[Option<f64>],
    y: &[Option<f64>],
    z: &[Option<f64>],
    w: &[Option<f64>],
) -> [Vec<Option<f64>>; 3] {
    let mut axes: [Vec<Option<f64>>; 3] = Default::default();
    for row in 0..x.len() {
        let angles = Quaternion::from_options(x[row], y[row], z[row], w[row])
            .and_then(|q| q.intrinsic_xyz())
            .map(|e| e.to_degrees().as_array());
        for (axis, values) in axes.iter_mut().enumerate() {
            values.push(angles.map(|a| a[axis]));
        }
    }
    axes
}

/// Pointwise differences. A row missing on either side gives NaN so an
/// incomplete comparison never passes for a complete one.
fn differences<'a>(a: &'a [Option<f64>], b: &'a [Option<f64>]) -> impl Iterator<Item = f64> + 'a {
    a.iter().zip(b).map(|(x, y)| match (x, y) {
        (Some(x), Some(y)) => x - y,
        _ => f64::NAN,
    })
}

fn log_incomplete(a: &[Option<f64>], b: &[Option<f64>]) {
    let missing = a.iter().zip(b).filter(|(x, y)| x.is_none() || y.is_none()).count();
    if missing > 0 {
        debug!("{} of {} compared rows have a missing value", missing, a.len().min(b.len()));
    }
}

fn sum_squared(a: &[Option<f64>], b: &[Option<f64>]) -> Option<f64> {
    if a.is_empty() || b.is_empty() {
        return None;
    }
    log_incomplete(a, b);
    Some(differences(a, b).map(|d| d * d).sum::<f64>())
}

fn mean_absolute(a: &[Option<f64>], b: &[Option<f64>]) -> Option<f64> {
    let n = a.len().min(b.len());
    if n == 0 {
        return None;
    }
    log_incomplete(a, b);
    Some(differences(a, b).map(f64::abs).sum::<f64>() / n as f64)
}
