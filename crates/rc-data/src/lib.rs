pub mod corpus;
pub mod orientation;
pub mod rksml;
pub mod series;
pub mod sim_table;
pub mod storage;

pub use corpus::CorpusBuilder;
pub use orientation::{EulerAngles, Quaternion};
pub use rksml::{load, ChannelStats, CropParams, Extremum, LoadOptions, TelemetryLog};
pub use series::{interp, Column, TelemetrySeries, TimeRange};
pub use sim_table::SimulatorTable;
pub use storage::SeriesStore;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::time::UNIX_EPOCH;

use rc_types::TelemetryError;

/// Load the recorded side of a comparison. RKSML documents (`.xml`,
/// `.rksml`) go through the loader and are cropped to their usable range;
/// anything else is read as a combined-telemetry CSV.
///
/// With `options.cache_dir` set, a parsed RKSML document is stored as
/// Parquet and later loads of the unchanged document read that instead.
pub fn load_recorded<P: AsRef<Path>>(path: P, options: &LoadOptions) -> Result<TelemetrySeries, TelemetryError> {
    let path = path.as_ref();
    if !is_rksml(path) {
        return TelemetrySeries::from_csv(path);
    }
    let Some(cache_dir) = &options.cache_dir else {
        return Ok(load(path, options)?.cropped());
    };

    let store = SeriesStore::new(cache_dir)?;
    let key = cache_key(path, options)?;
    if store.contains(&key) {
        match store.load(&key) {
            Ok(series) => {
                tracing::info!("Recorded telemetry {} served from {}", path.display(), store.path_for(&key).display());
                return Ok(series);
            }
            Err(e) => tracing::warn!("Ignoring unreadable cache entry {}: {}", key, e),
        }
    }

    let series = load(path, options)?.cropped();
    if let Err(e) = store.save(&key, &series) {
        tracing::warn!("Unable to cache {}: {}", path.display(), e);
    }
    Ok(series)
}

/// Cache entry name. Changes when the document is rewritten or the load
/// bounds differ.
fn cache_key(path: &Path, options: &LoadOptions) -> Result<String, TelemetryError> {
    let meta = std::fs::metadata(path).map_err(|e| TelemetryError::io(path.display().to_string(), e))?;
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_nanos());

    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    options.start.map(f64::to_bits).hash(&mut hasher);
    options.end.map(f64::to_bits).hash(&mut hasher);
    options
        .crop
        .map(|c| (c.max_hidden_nodes, c.max_sclk_gap.to_bits()))
        .hash(&mut hasher);

    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("telemetry");
    Ok(format!("{stem}-{:016x}-{}-{modified:x}", hasher.finish(), meta.len()))
}

fn is_rksml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref(),
        Some("xml") | Some("rksml")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn recorded_side_is_resolved_by_extension() {
        let dir = tempdir().unwrap();

        let csv_path = dir.path().join("open_loop.csv");
        fs::write(&csv_path, "SCLK,ROVER_X [METERS]\n1,0\n2,1\n").unwrap();
        let series = load_recorded(&csv_path, &LoadOptions::new()).unwrap();
        assert_eq!(series.len(), 2);

        let xml_path = dir.path().join("sol.rksml.xml");
        fs::write(
            &xml_path,
            "<RPK_Set xmlns=\"RPK\"><State_History>\
             <Node Time=\"1\"><Knot Name=\"ROVER_X\" Units=\"METERS\">0</Knot></Node>\
             <Node Time=\"2\"><Knot Name=\"ROVER_X\" Units=\"METERS\">1</Knot></Node>\
             </State_History></RPK_Set>",
        )
        .unwrap();
        let series = load_recorded(&xml_path, &LoadOptions::new()).unwrap();
        assert_eq!(series.index(), &[1.0, 2.0]);
        assert!(series.has_channel(rksml::TURN_IN_PLACE_STEERING));
    }

    fn rksml_doc(times: &[u32]) -> String {
        let nodes: String = times
            .iter()
            .map(|t| format!("<Node Time=\"{t}\"><Knot Name=\"ROVER_X\" Units=\"METERS\">{t}</Knot></Node>"))
            .collect();
        format!("<RPK_Set xmlns=\"RPK\"><State_History>{nodes}</State_History></RPK_Set>")
    }

    #[test]
    fn parsed_documents_are_cached_as_parquet() {
        let dir = tempdir().unwrap();
        let xml_path = dir.path().join("sol01578.rksml");
        fs::write(&xml_path, rksml_doc(&[1, 2])).unwrap();
        let cache = dir.path().join("cache");
        let options = LoadOptions::new().with_cache_dir(&cache);

        let first = load_recorded(&xml_path, &options).unwrap();
        let store = SeriesStore::new(&cache).unwrap();
        let names = store.list().unwrap();
        assert_eq!(names.len(), 1);
        assert_eq!(store.load(&names[0]).unwrap(), first);

        // A second load reads the cache entry, not the document.
        let stand_in = TelemetrySeries::from_csv_reader("SCLK,ROVER_X [METERS]\n5,9\n".as_bytes(), "stand-in").unwrap();
        store.save(&names[0], &stand_in).unwrap();
        assert_eq!(load_recorded(&xml_path, &options).unwrap(), stand_in);

        // Rewriting the document invalidates the entry.
        fs::write(&xml_path, rksml_doc(&[1, 2, 3])).unwrap();
        let reparsed = load_recorded(&xml_path, &options).unwrap();
        assert_eq!(reparsed.index(), &[1.0, 2.0, 3.0]);
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn uncached_load_writes_nothing() {
        let dir = tempdir().unwrap();
        let xml_path = dir.path().join("sol.xml");
        fs::write(&xml_path, rksml_doc(&[1, 2])).unwrap();
        load_recorded(&xml_path, &LoadOptions::new()).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
