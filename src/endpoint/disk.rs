//! Disk endpoint: one JSON file per finalized report, plus a background
//! sweep that deletes reports past their retention window.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DiskEndpointConfig;
use crate::error::Error;
use crate::report::Report;

/// How often the expiration sweep scans the report directory.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const REPORT_PREFIX: &str = "report_";
const REPORT_SUFFIX: &str = ".json";

/// Writes finalized reports into a directory as individual JSON files.
///
/// File names embed the write time, so the expiration sweep can decide
/// staleness without opening the file: `report_<rfc3339>_<rand>.json`.
#[derive(Debug)]
pub struct DiskEndpoint {
    name: String,
    report_dir: PathBuf,
    expiration: Duration,
}

impl DiskEndpoint {
    /// Opens the endpoint, creating the report directory if needed.
    pub fn open(name: &str, cfg: &DiskEndpointConfig) -> Result<Self, Error> {
        std::fs::create_dir_all(&cfg.report_dir)?;
        Ok(Self {
            name: name.to_string(),
            report_dir: cfg.report_dir.clone(),
            expiration: Duration::from_secs(cfg.expire_seconds as u64),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Writes one report durably: temp file in the same directory, fsync,
    /// then rename into its final name. A consumer scanning the directory
    /// never sees a partial report.
    pub fn send(&self, report: &Report) -> Result<(), Error> {
        let file_name = report_file_name(Utc::now());
        let path = self.report_dir.join(&file_name);
        let tmp = self.report_dir.join(format!("{file_name}.tmp"));

        let data = serde_json::to_vec_pretty(report).map_err(Error::validation)?;
        let mut file = File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        std::fs::rename(&tmp, &path)?;

        debug!(
            endpoint = %self.name,
            metric = %report.name,
            file = %file_name,
            "wrote report",
        );
        Ok(())
    }

    /// Periodic expiration sweep. Exits when `token` is cancelled. A zero
    /// expiration disables the sweep entirely.
    pub async fn run_sweeper(&self, token: CancellationToken) {
        if self.expiration.is_zero() {
            return;
        }
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately and clears anything left over
        // from a previous run.
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!(endpoint = %self.name, "expiration sweep stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let cutoff = Utc::now()
                        - chrono::Duration::from_std(self.expiration)
                            .unwrap_or(chrono::Duration::zero());
                    if let Err(e) = self.cleanup(cutoff) {
                        warn!(endpoint = %self.name, error = %e, "expiration sweep failed");
                    }
                }
            }
        }
    }

    /// Deletes every report written before `cutoff`. Files that do not
    /// follow the report naming scheme are left alone.
    pub fn cleanup(&self, cutoff: DateTime<Utc>) -> Result<(), Error> {
        let mut removed = 0usize;
        for entry in std::fs::read_dir(&self.report_dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if !is_expired(file_name, cutoff) {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(
                        endpoint = %self.name,
                        file = %file_name,
                        error = %e,
                        "failed to remove expired report",
                    );
                }
            }
        }
        if removed > 0 {
            info!(endpoint = %self.name, removed, "removed expired reports");
        }
        Ok(())
    }
}

/// Builds the file name for a report written at `now`.
fn report_file_name(now: DateTime<Utc>) -> String {
    let ts = now.to_rfc3339_opts(SecondsFormat::Secs, true);
    let rand: String = Uuid::new_v4().simple().to_string()[..5].to_string();
    format!("{REPORT_PREFIX}{ts}_{rand}{REPORT_SUFFIX}")
}

/// Parses the embedded write time out of a report file name. Returns `None`
/// for names that do not follow the report naming scheme.
fn parse_report_time(file_name: &str) -> Option<DateTime<Utc>> {
    let inner = file_name
        .strip_prefix(REPORT_PREFIX)?
        .strip_suffix(REPORT_SUFFIX)?;
    let (ts, _rand) = inner.rsplit_once('_')?;
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// True when `file_name` names a report written before `cutoff`.
fn is_expired(file_name: &str, cutoff: DateTime<Utc>) -> bool {
    match parse_report_time(file_name) {
        Some(written) => written < cutoff,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::MetricValue;
    use chrono::TimeZone;
    use std::path::Path;

    fn endpoint(dir: &Path, expire_seconds: i64) -> DiskEndpoint {
        DiskEndpoint::open(
            "disk",
            &DiskEndpointConfig {
                report_dir: dir.to_path_buf(),
                expire_seconds,
            },
        )
        .unwrap()
    }

    fn sample_report() -> Report {
        Report {
            name: "requests".to_string(),
            start_time: Utc.timestamp_opt(100, 0).unwrap(),
            end_time: Utc.timestamp_opt(110, 0).unwrap(),
            value: MetricValue::int64(10),
        }
    }

    fn list_reports(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_send_writes_parseable_report() {
        let dir = tempfile::tempdir().unwrap();
        let ep = endpoint(dir.path(), 3600);
        ep.send(&sample_report()).unwrap();

        let names = list_reports(dir.path());
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with(REPORT_PREFIX));
        assert!(names[0].ends_with(REPORT_SUFFIX));

        let data = std::fs::read_to_string(dir.path().join(&names[0])).unwrap();
        let parsed = Report::from_json(&data).unwrap();
        assert_eq!(parsed, sample_report());
    }

    #[test]
    fn test_send_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let ep = endpoint(dir.path(), 3600);
        ep.send(&sample_report()).unwrap();
        ep.send(&sample_report()).unwrap();

        assert!(list_reports(dir.path())
            .iter()
            .all(|n| !n.ends_with(".tmp")));
    }

    #[test]
    fn test_file_name_round_trips_timestamp() {
        let written = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let name = report_file_name(written);
        assert_eq!(parse_report_time(&name), Some(written));
    }

    #[test]
    fn test_is_expired() {
        let written = Utc.timestamp_opt(1000, 0).unwrap();
        let name = report_file_name(written);

        assert!(is_expired(&name, Utc.timestamp_opt(2000, 0).unwrap()));
        assert!(!is_expired(&name, Utc.timestamp_opt(500, 0).unwrap()));
        // Same instant is not yet expired.
        assert!(!is_expired(&name, written));
    }

    #[test]
    fn test_unrecognized_files_never_expire() {
        let cutoff = Utc.timestamp_opt(i32::MAX as i64, 0).unwrap();
        assert!(!is_expired("notes.txt", cutoff));
        assert!(!is_expired("report_garbage.json", cutoff));
        assert!(!is_expired("report_2024-01-01T00:00:00Z_ab1c2.tmp", cutoff));
    }

    #[test]
    fn test_cleanup_removes_only_expired_reports() {
        let dir = tempfile::tempdir().unwrap();
        let ep = endpoint(dir.path(), 3600);

        let old = report_file_name(Utc.timestamp_opt(1000, 0).unwrap());
        let fresh = report_file_name(Utc::now());
        std::fs::write(dir.path().join(&old), b"{}").unwrap();
        std::fs::write(dir.path().join(&fresh), b"{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"keep me").unwrap();

        let cutoff = Utc::now() - chrono::Duration::seconds(3600);
        ep.cleanup(cutoff).unwrap();

        let names = list_reports(dir.path());
        assert!(!names.contains(&old));
        assert!(names.contains(&fresh));
        assert!(names.contains(&"notes.txt".to_string()));
    }
}
