//! CSV result files.
//!
//! A results file starts with a short banner when the run did not finish
//! normally, followed by the photometry summary, the sensor settings and the
//! sorted sample table. The raw file holds the bare table only.

use crate::config::ResultSettings;
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Local};
use csv::{ReaderBuilder, Writer, WriterBuilder};
use gonio_lib::{SampleSet, SessionOutcome, SphericalSample};
use std::fmt::Write as _;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const RAW_DIR: &str = "raws";
pub const TABLE_HEADER: [&str; 3] = ["Polar angle (º)", "Azimuth angle (º)", "Luminous intensity (cd)"];

/// Sensor values printed alongside the table.
#[derive(Debug, Clone, Copy)]
pub struct SensorSummary {
    pub distance_m: f64,
    pub offset_v: f64,
}

/// Files produced for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenFiles {
    pub results: PathBuf,
    pub raw: Option<PathBuf>,
}

pub struct ResultWriter {
    directory: PathBuf,
    prefix: String,
    delimiter: u8,
    store_raw: bool,
}

impl ResultWriter {
    /// Fails when `prefix_format` is not a valid `chrono` format string.
    pub fn new(settings: &ResultSettings, started: DateTime<Local>) -> Result<Self> {
        let mut prefix = String::new();
        write!(prefix, "{}", started.format(&settings.prefix_format))
            .map_err(|_| anyhow!("Invalid result prefix format '{}'", settings.prefix_format))?;
        Ok(Self {
            directory: settings.directory.clone(),
            prefix,
            delimiter: delimiter(settings.csv_separator),
            store_raw: settings.store_raw,
        })
    }

    pub fn results_path(&self, name: &str) -> PathBuf {
        self.directory.join(format!("{}_{}.csv", self.prefix, name))
    }

    pub fn raw_path(&self, name: &str) -> PathBuf {
        self.directory
            .join(RAW_DIR)
            .join(format!("{}_{}_RAW.csv", self.prefix, name))
    }

    /// Writes the files for `outcome`. Nothing is written for a run without
    /// samples.
    pub fn write(&self, outcome: &SessionOutcome, sensor: SensorSummary) -> Result<Option<WrittenFiles>> {
        if outcome.samples.is_empty() {
            warn!(name = %outcome.name, "no samples received, nothing written");
            return Ok(None);
        }

        fs::create_dir_all(&self.directory)
            .with_context(|| format!("Failed to create results directory {:?}", self.directory))?;
        let results = self.results_path(&outcome.name);
        self.write_results(&results, outcome, sensor)
            .with_context(|| format!("Failed to write results to {:?}", results))?;
        info!(path = %results.display(), samples = outcome.samples.len(), "results written");

        let raw = if self.store_raw && outcome.ended_normally() {
            let path = self.raw_path(&outcome.name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).with_context(|| format!("Failed to create {:?}", parent))?;
            }
            let mut writer = self.writer(&path)?;
            write_table(&mut writer, &outcome.samples)?;
            writer.flush()?;
            info!(path = %path.display(), "raw table written");
            Some(path)
        } else {
            None
        };

        Ok(Some(WrittenFiles { results, raw }))
    }

    fn writer(&self, path: &Path) -> Result<Writer<File>> {
        let file = File::create(path).with_context(|| format!("Failed to create {:?}", path))?;
        Ok(WriterBuilder::new()
            .delimiter(self.delimiter)
            .flexible(true)
            .from_writer(file))
    }

    fn write_results(&self, path: &Path, outcome: &SessionOutcome, sensor: SensorSummary) -> Result<()> {
        let mut writer = self.writer(path)?;

        if outcome.stopped_by_user {
            writer.write_record(["MEASURE STOPPED BY USER"])?;
            writer.write_record(["Results based on available data."])?;
        } else if outcome.had_error {
            writer.write_record(["MEASURE STOPPED DUE TO ERRORS"])?;
            writer.write_record(["Results based on available data."])?;
        }

        if let Some(report) = &outcome.photometry {
            match &report.flux {
                Ok(flux) => writer.write_record(["Luminous flux (lm)", format!("{flux:.2}").as_str()])?,
                Err(e) => writer.write_record(["Luminous flux (lm)", e.to_string().as_str()])?,
            }
            writer.write_record(["Horizontal FWHM (º)", format!("{:.2}", report.fwhm.horizontal).as_str()])?;
            writer.write_record(["Vertical FWHM (º)", format!("{:.2}", report.fwhm.vertical).as_str()])?;
        }
        writer.write_record(["Sensor distance (m)", sensor.distance_m.to_string().as_str()])?;
        writer.write_record(["Calibration offset (V)", sensor.offset_v.to_string().as_str()])?;

        writer.write_record(TABLE_HEADER)?;
        write_table(&mut writer, &outcome.samples)?;
        writer.flush()?;
        Ok(())
    }
}

fn write_table(writer: &mut Writer<File>, samples: &SampleSet) -> Result<()> {
    for sample in samples {
        writer.write_record([
            sample.polar.to_string(),
            sample.azimuth.to_string(),
            sample.intensity.to_string(),
        ])?;
    }
    Ok(())
}

/// Reads samples back from a results or raw file.
///
/// Rows that are not three numbers (banner, summary, header) are skipped.
pub fn read_samples(path: &Path, separator: char) -> Result<SampleSet> {
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter(separator))
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {:?}", path))?;

    let mut samples = Vec::new();
    let mut skipped = 0usize;
    for record in reader.records() {
        let record = record.with_context(|| format!("Failed to read {:?}", path))?;
        match parse_row(&record) {
            Some(sample) => samples.push(sample),
            None => skipped += 1,
        }
    }
    debug!(samples = samples.len(), skipped, "sample file read");
    Ok(SampleSet::new(samples))
}

fn parse_row(record: &csv::StringRecord) -> Option<SphericalSample> {
    if record.len() != 3 {
        return None;
    }
    let polar = record[0].trim().parse::<f32>().ok()?;
    let azimuth = record[1].trim().parse::<f32>().ok()?;
    let intensity = record[2].trim().parse::<f64>().ok()?;
    Some(SphericalSample::new(polar, azimuth, intensity))
}

fn delimiter(separator: char) -> u8 {
    u8::try_from(separator).unwrap_or(b',')
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use gonio_lib::photometry;
    use gonio_lib::{Operation, Resolution, SessionState};

    fn outcome(samples: Vec<SphericalSample>) -> SessionOutcome {
        let samples = SampleSet::new(samples);
        let photometry = Some(photometry::analyze(&samples, Resolution::new(90.0, 180.0)));
        SessionOutcome {
            name: "lamp".to_string(),
            operation: Operation::Measure,
            final_state: SessionState::Done,
            samples,
            stopped_by_user: false,
            had_error: false,
            device_unresponsive: false,
            malformed_records: 0,
            calibration_offset: None,
            photometry,
            errors: Vec::new(),
        }
    }

    fn writer(dir: &Path, store_raw: bool) -> ResultWriter {
        let settings = ResultSettings {
            directory: dir.to_path_buf(),
            store_raw,
            ..ResultSettings::default()
        };
        let started = Local.with_ymd_and_hms(2024, 3, 7, 14, 5, 0).unwrap();
        ResultWriter::new(&settings, started).unwrap()
    }

    const SENSOR: SensorSummary = SensorSummary {
        distance_m: 1.0,
        offset_v: 0.0,
    };

    #[test]
    fn test_file_names_use_prefix() {
        let w = writer(Path::new("out"), false);
        assert_eq!(w.results_path("lamp"), Path::new("out/24_03_07-14h05_lamp.csv"));
        assert_eq!(w.raw_path("lamp"), Path::new("out/raws/24_03_07-14h05_lamp_RAW.csv"));
    }

    #[test]
    fn test_invalid_prefix_format_is_an_error() {
        let settings = ResultSettings {
            prefix_format: "%y_%Q".to_string(),
            ..ResultSettings::default()
        };
        assert!(ResultWriter::new(&settings, Local::now()).is_err());
    }

    #[test]
    fn test_results_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path(), true);
        let outcome = outcome(vec![
            SphericalSample::new(90.0, 0.0, 1.0),
            SphericalSample::new(0.0, 0.0, 2.0),
        ]);

        let written = w.write(&outcome, SENSOR).unwrap().unwrap();
        let text = fs::read_to_string(&written.results).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("Luminous flux (lm),"));
        assert!(lines.contains(&"Polar angle (º),Azimuth angle (º),Luminous intensity (cd)"));
        // Table rows come out sorted by polar angle
        assert_eq!(lines[lines.len() - 2], "0,0,2");
        assert_eq!(lines[lines.len() - 1], "90,0,1");

        let raw = fs::read_to_string(written.raw.unwrap()).unwrap();
        assert_eq!(raw, "0,0,2\n90,0,1\n");
    }

    #[test]
    fn test_stopped_run_has_banner_and_no_raw() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path(), true);
        let mut outcome = outcome(vec![SphericalSample::new(0.0, 0.0, 2.0)]);
        outcome.stopped_by_user = true;

        let written = w.write(&outcome, SENSOR).unwrap().unwrap();
        let text = fs::read_to_string(&written.results).unwrap();
        assert!(text.starts_with("MEASURE STOPPED BY USER\nResults based on available data.\n"));
        assert!(written.raw.is_none());
    }

    #[test]
    fn test_empty_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path(), true);
        assert!(w.write(&outcome(Vec::new()), SENSOR).unwrap().is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_results_file_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer(dir.path(), false);
        let outcome = outcome(vec![
            SphericalSample::new(0.0, 0.0, 2.0),
            SphericalSample::new(90.0, 180.0, 0.5),
        ]);
        let written = w.write(&outcome, SENSOR).unwrap().unwrap();

        let samples = read_samples(&written.results, ',').unwrap();
        assert_eq!(samples, outcome.samples);
    }
}
