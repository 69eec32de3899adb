//! Pipeline driver: snapshot, decode, normalize and write every requested hive.

use crate::{
    cli::Config,
    error::{Error, Result},
    normalize::TableBuilder,
    output::write_table,
    registry::{HiveDecoder, RegfDecoder},
    snapshot::{RegSave, Snapshotter},
    types::{HiveKind, HiveOutcome, HiveRequest, HiveSource, RunReport},
};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use rayon::prelude::*;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};

/// Main application runner
pub struct App {
    config: Config,
    snapshotter: Box<dyn Snapshotter>,
    decoder: Box<dyn HiveDecoder>,
}

impl App {
    /// Create an application using `reg save` and the regf decoder
    pub fn new(config: Config) -> Self {
        let snapshotter = RegSave::new(config.snapshot_program.clone()).with_timeout(config.snapshot_timeout);
        Self::with_components(config, Box::new(snapshotter), Box::new(RegfDecoder))
    }

    pub fn with_components(
        config: Config,
        snapshotter: Box<dyn Snapshotter>,
        decoder: Box<dyn HiveDecoder>,
    ) -> Self {
        Self {
            config,
            snapshotter,
            decoder,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Process every requested hive and report one outcome per hive.
    ///
    /// Only whole-run problems are returned as errors; anything that goes wrong
    /// inside a single hive ends up as a [`HiveOutcome::Failure`].
    pub fn run(&self) -> Result<RunReport> {
        self.config.validate()?;

        let needs_snapshots = self.config.needs_snapshots();
        if needs_snapshots && !self.config.elevated {
            return Err(Error::Elevation(
                "saving live hives requires Administrator rights".to_string(),
            ));
        }

        std::fs::create_dir_all(&self.config.output_dir).map_err(|err| Error::OutputWrite {
            path: self.config.output_dir.clone(),
            reason: format!("cannot create output directory: {}", err),
        })?;

        // Removed on drop, whatever happens to the tasks
        let scratch = if needs_snapshots {
            Some(tempfile::Builder::new().prefix("regtriage-").tempdir()?)
        } else {
            None
        };
        let scratch_dir = scratch.as_ref().map(|dir| dir.path());

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.max_workers)
            .thread_name(|index| format!("regtriage-hive-{}", index))
            .build()
            .map_err(|err| Error::WorkerPool(err.to_string()))?;

        info!(
            "Processing {} hive(s) with {} worker(s), writing to {}",
            self.config.requests.len(),
            self.config.max_workers,
            self.config.output_dir.display()
        );

        let pb = ProgressBar::new(self.config.requests.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        pb.set_message("Processing hives");

        let outcomes: Vec<(HiveKind, HiveOutcome)> = pool.install(|| {
            self.config
                .requests
                .par_iter()
                .map(|request| {
                    let outcome = self.run_task(request, scratch_dir);
                    pb.inc(1);
                    (request.kind(), outcome)
                })
                .collect()
        });
        pb.finish_and_clear();

        let report = RunReport {
            outcomes: outcomes.into_iter().collect(),
        };
        if report.failed() > 0 {
            warn!("{} of {} hive(s) failed", report.failed(), report.outcomes.len());
        }
        Ok(report)
    }

    /// Run one hive task, turning errors and panics into a failure outcome
    fn run_task(&self, request: &HiveRequest, scratch: Option<&Path>) -> HiveOutcome {
        let kind = request.kind();
        match catch_unwind(AssertUnwindSafe(|| self.process(request, scratch))) {
            Ok(Ok((output, rows))) => {
                info!("{}: wrote {} row(s) to {}", kind, rows, output.display());
                HiveOutcome::Success { output, rows }
            }
            Ok(Err(err)) => {
                error!("{}: {}", kind, err);
                HiveOutcome::Failure {
                    hive: kind,
                    reason: err.to_string(),
                }
            }
            Err(payload) => {
                let reason = format!("worker panicked: {}", panic_message(payload.as_ref()));
                error!("{}: {}", kind, reason);
                HiveOutcome::Failure { hive: kind, reason }
            }
        }
    }

    fn process(&self, request: &HiveRequest, scratch: Option<&Path>) -> Result<(PathBuf, usize)> {
        let kind = request.kind();
        let hive_path = match request.source() {
            HiveSource::File(path) => path.clone(),
            HiveSource::Snapshot => {
                let dir = scratch.ok_or_else(|| {
                    Error::InvalidInput(format!("no snapshot directory for {}", kind))
                })?;
                let destination = dir.join(kind.snapshot_file_name());
                info!("{}: saving {}", kind, kind.live_key());
                self.snapshotter.snapshot(kind.live_key(), &destination)?;
                destination
            }
        };

        let mut builder = TableBuilder::new();
        let records = self.decoder.decode(&hive_path).map_err(|err| Error::Decode {
            hive: kind,
            records: 0,
            reason: err.to_string(),
        })?;
        for record in records {
            let record = record.map_err(|err| Error::Decode {
                hive: kind,
                records: builder.records(),
                reason: err.to_string(),
            })?;
            builder.push(record);
        }

        let table = builder.finish()?;
        if table.timestamp_warnings() > 0 {
            warn!("{}: {} timestamp(s) kept in raw form", kind, table.timestamp_warnings());
        }

        let output = self
            .config
            .output_dir
            .join(format!("{}.csv", request.output_stem()));
        write_table(&table, &output)?;
        Ok((output, table.len()))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SnapshotError;
    use crate::registry::KeyRecords;
    use crate::types::KeyRecord;
    use crate::test_support::{sample_hive, write_sample_hive};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Writes a sample hive instead of calling `reg`
    #[derive(Default)]
    struct FakeSnapshotter {
        calls: Arc<AtomicUsize>,
        destinations: Arc<Mutex<Vec<PathBuf>>>,
        fail_key: Option<&'static str>,
    }

    impl Snapshotter for FakeSnapshotter {
        fn snapshot(&self, key_path: &str, destination: &Path) -> std::result::Result<(), SnapshotError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_key == Some(key_path) {
                return Err(SnapshotError::AccessDenied("ERROR: Access is denied.".to_string()));
            }
            std::fs::write(destination, sample_hive(key_path)).unwrap();
            self.destinations.lock().unwrap().push(destination.to_path_buf());
            Ok(())
        }
    }

    /// Panics on one file name, decodes everything else
    struct PanickyDecoder {
        file_name: &'static str,
    }

    impl HiveDecoder for PanickyDecoder {
        fn decode(&self, path: &Path) -> Result<KeyRecords> {
            if path.file_name().and_then(|n| n.to_str()) == Some(self.file_name) {
                panic!("corrupt cell in {}", self.file_name);
            }
            RegfDecoder.decode(path)
        }
    }

    /// Yields `good` records, then a decode error
    struct TruncatedDecoder {
        good: usize,
    }

    impl HiveDecoder for TruncatedDecoder {
        fn decode(&self, _path: &Path) -> Result<KeyRecords> {
            let mut records: Vec<Result<KeyRecord>> = (0..self.good)
                .map(|i| {
                    Ok(KeyRecord::new(format!(r"ROOT\Key{}", i), "2023-08-14T09:15:42.000000+00:00")
                        .with_value("Index", i.to_string()))
                })
                .collect();
            records.push(Err(Error::HiveFormat("truncated cell at 0x2000".to_string())));
            Ok(Box::new(records.into_iter()))
        }
    }

    fn app(config: Config, snapshotter: FakeSnapshotter) -> App {
        App::with_components(config, Box::new(snapshotter), Box::new(RegfDecoder))
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[test]
    fn test_given_files_are_decoded_without_snapshots() {
        let input = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let requests = vec![
            HiveRequest::from_file(HiveKind::Sam, write_sample_hive(input.path(), "SAM", "sam")),
            HiveRequest::from_file(HiveKind::System, write_sample_hive(input.path(), "SYSTEM", "system")),
        ];
        let snapshotter = FakeSnapshotter::default();
        let calls = snapshotter.calls.clone();

        let report = app(Config::new(requests, out.path()), snapshotter).run().unwrap();

        assert_eq!(report.succeeded(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let mut written: Vec<String> = std::fs::read_dir(out.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        written.sort();
        assert_eq!(written, vec!["SAM.csv", "SYSTEM.csv"]);

        let csv = read(&out.path().join("SAM.csv"));
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "Timestamp,Path,Owner,Build,Current,Note");
        // Newest first; the value-less Test key and the bare root are dropped
        assert!(lines[1].contains(r"ROOT\Select"));
        assert!(lines[2].contains(r"ROOT\Software\Vendor"));
        assert_eq!(lines.len(), 3);
        assert_eq!(
            report.outcomes[&HiveKind::Sam],
            HiveOutcome::Success {
                output: out.path().join("SAM.csv"),
                rows: 2
            }
        );
    }

    #[test]
    fn test_one_failing_hive_does_not_affect_the_others() {
        let input = tempfile::tempdir().unwrap();
        let names = [
            (HiveKind::Sam, "SAM"),
            (HiveKind::System, "SYSTEM"),
            (HiveKind::Software, "SOFTWARE"),
            (HiveKind::Security, "SECURITY"),
        ];
        let mut requests: Vec<HiveRequest> = names
            .iter()
            .map(|(kind, name)| HiveRequest::from_file(*kind, write_sample_hive(input.path(), name, name)))
            .collect();

        let healthy_out = tempfile::tempdir().unwrap();
        let healthy = app(Config::new(requests.clone(), healthy_out.path()), FakeSnapshotter::default())
            .run()
            .unwrap();
        assert_eq!(healthy.succeeded(), 4);

        let broken = input.path().join("DEFAULT");
        std::fs::write(&broken, b"not a registry hive at all").unwrap();
        requests.push(HiveRequest::from_file(HiveKind::Default, &broken));

        let mixed_out = tempfile::tempdir().unwrap();
        let mut config = Config::new(requests, mixed_out.path());
        config.max_workers = 5;
        let mixed = app(config, FakeSnapshotter::default()).run().unwrap();

        assert_eq!(mixed.succeeded(), 4);
        assert_eq!(mixed.failed(), 1);
        match &mixed.outcomes[&HiveKind::Default] {
            HiveOutcome::Failure { hive, reason } => {
                assert_eq!(*hive, HiveKind::Default);
                assert!(reason.contains("DEFAULT hive"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!mixed_out.path().join("DEFAULT.csv").exists());
        for (_, name) in names {
            let file = format!("{}.csv", name);
            assert_eq!(
                read(&healthy_out.path().join(&file)),
                read(&mixed_out.path().join(&file))
            );
        }
    }

    #[test]
    fn test_snapshots_require_elevation() {
        let out = tempfile::tempdir().unwrap();
        let target = out.path().join("never-created");
        let snapshotter = FakeSnapshotter::default();
        let calls = snapshotter.calls.clone();

        let config = Config::new(vec![HiveRequest::snapshot(HiveKind::Sam)], &target);
        let result = app(config, snapshotter).run();

        assert!(matches!(result, Err(Error::Elevation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!target.exists());
    }

    #[test]
    fn test_snapshot_mode_writes_hive_named_outputs_and_cleans_up() {
        let out = tempfile::tempdir().unwrap();
        let requests = HiveKind::ALL.iter().map(|kind| HiveRequest::snapshot(*kind)).collect();
        let mut config = Config::new(requests, out.path());
        config.elevated = true;
        let snapshotter = FakeSnapshotter {
            fail_key: Some("HKLM\\SECURITY"),
            ..FakeSnapshotter::default()
        };
        let destinations = snapshotter.destinations.clone();

        let report = app(config, snapshotter).run().unwrap();

        assert_eq!(report.succeeded(), 4);
        for name in ["sam", "system", "software", "default"] {
            assert!(out.path().join(format!("{}.csv", name)).exists(), "{}", name);
        }
        assert!(!out.path().join("security.csv").exists());
        assert!(matches!(
            &report.outcomes[&HiveKind::Security],
            HiveOutcome::Failure { reason, .. } if reason.contains("access denied")
        ));
        assert!(read(&out.path().join("default.csv")).contains("HKEY_USERS\\.DEFAULT"));

        let destinations = destinations.lock().unwrap();
        assert_eq!(destinations.len(), 4);
        for destination in destinations.iter() {
            assert!(!destination.exists());
            assert!(!destination.parent().unwrap().exists());
        }
    }

    #[test]
    fn test_worker_panic_is_isolated() {
        let input = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let requests = vec![
            HiveRequest::from_file(HiveKind::Sam, write_sample_hive(input.path(), "SAM", "sam")),
            HiveRequest::from_file(HiveKind::System, write_sample_hive(input.path(), "SYSTEM", "system")),
        ];
        let app = App::with_components(
            Config::new(requests, out.path()),
            Box::new(FakeSnapshotter::default()),
            Box::new(PanickyDecoder { file_name: "SYSTEM" }),
        );

        let report = app.run().unwrap();

        assert!(report.outcomes[&HiveKind::Sam].is_success());
        match &report.outcomes[&HiveKind::System] {
            HiveOutcome::Failure { reason, .. } => assert!(reason.contains("corrupt cell in SYSTEM")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_decode_error_mid_hive_discards_partial_output() {
        let out = tempfile::tempdir().unwrap();
        let requests = vec![HiveRequest::from_file(HiveKind::Software, "/evidence/SOFTWARE")];
        let app = App::with_components(
            Config::new(requests, out.path()),
            Box::new(FakeSnapshotter::default()),
            Box::new(TruncatedDecoder { good: 3 }),
        );

        let report = app.run().unwrap();

        match &report.outcomes[&HiveKind::Software] {
            HiveOutcome::Failure { hive, reason } => {
                assert_eq!(*hive, HiveKind::Software);
                assert!(reason.contains("after 3 record(s)"), "{}", reason);
                assert!(reason.contains("truncated cell"), "{}", reason);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!out.path().join("SOFTWARE.csv").exists());
        assert_eq!(std::fs::read_dir(out.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_empty_request_set_is_fatal() {
        let out = tempfile::tempdir().unwrap();
        let result = app(Config::new(Vec::new(), out.path()), FakeSnapshotter::default()).run();
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
