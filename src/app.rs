use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use camino::Utf8Path;
use serde::Serialize;

use crate::collate::Collator;
use crate::digest::file_md5;
use crate::error::KiraError;
use crate::extract::{MetadataExtractor, ScreenRules, Screened};
use crate::ledger::Ledger;
use crate::matcher::Matcher;
use crate::record::{FileMatch, Status};
use crate::scan::source_files;
use crate::transport::ArchiveTransport;
use crate::upload::{Upload, UploadSummary};

/// Files walked between intermediate saves of the file list during a scan.
pub const SCAN_FLUSH_EVERY: usize = 500;

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub include_unmatched: bool,
    pub skip_image_types: Vec<String>,
    /// Rewrite the file list after this many files; 0 saves only at the end.
    pub flush_every: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            include_unmatched: false,
            skip_image_types: Vec::new(),
            flush_every: SCAN_FLUSH_EVERY,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    pub source: String,
    pub ledger: String,
    pub files: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub written: usize,
}

#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub project: String,
    pub overwrite: bool,
    pub strict_scan_ids: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UploadResult {
    pub batches: Vec<UploadSummary>,
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub interrupted: bool,
}

impl UploadResult {
    fn push(&mut self, summary: UploadSummary) {
        self.uploaded += summary.uploaded;
        self.skipped += summary.skipped;
        self.failed += summary.failed;
        self.batches.push(summary);
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);

    /// Asked once an interrupt has been requested. Returning false resumes
    /// the run.
    fn confirm_interrupt(&self) -> bool {
        true
    }
}

/// Shared flag set from a signal handler and polled between transfers.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum BatchOutcome {
    Done(UploadSummary),
    Interrupted(UploadSummary),
}

pub struct App<T: ArchiveTransport, E: MetadataExtractor> {
    matcher: Matcher,
    transport: T,
    extractor: E,
    interrupt: Interrupt,
}

impl<T: ArchiveTransport, E: MetadataExtractor> App<T, E> {
    pub fn new(matcher: Matcher, transport: T, extractor: E) -> Self {
        Self {
            matcher,
            transport,
            extractor,
            interrupt: Interrupt::new(),
        }
    }

    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn interrupt(&self) -> Interrupt {
        self.interrupt.clone()
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Matches every file under `source` and writes the file list.
    pub fn scan(
        &self,
        source: &Utf8Path,
        ledger: &Ledger,
        options: ScanOptions,
        sink: &dyn ProgressSink,
    ) -> Result<ScanResult, KiraError> {
        let start = Instant::now();
        sink.event(ProgressEvent {
            message: format!("phase=Scan; walking {source}"),
            elapsed: None,
        });
        let files = source_files(source)?;
        let total = files.len();

        let extractor = Screened::new(
            &self.extractor,
            ScreenRules {
                skip_image_types: options.skip_image_types,
            },
        );

        let mut records = Vec::with_capacity(total);
        let mut matched = 0;
        let mut unmatched = 0;
        for (seen, file) in files.into_iter().enumerate() {
            if options.flush_every > 0 && seen > 0 && seen % options.flush_every == 0 {
                ledger.save(&records, &self.matcher)?;
                sink.event(ProgressEvent {
                    message: format!("phase=Store; {seen}/{total} files, {} rows", records.len()),
                    elapsed: Some(start.elapsed()),
                });
            }
            let record = self.matcher.match_file(source, file, &extractor);
            if record.status == Status::Matched {
                tracing::info!(
                    file = %record.file,
                    recipe = record.label.as_deref().unwrap_or_default(),
                    subject = record.subject().unwrap_or_default(),
                    "matched"
                );
                matched += 1;
            } else {
                tracing::debug!(
                    file = %record.file,
                    reason = record.error.as_deref().unwrap_or_default(),
                    "not matched"
                );
                unmatched += 1;
                if !options.include_unmatched {
                    continue;
                }
            }
            records.push(record);
        }

        sink.event(ProgressEvent {
            message: format!("phase=Store; writing {}", ledger.path()),
            elapsed: Some(start.elapsed()),
        });
        ledger.save(&records, &self.matcher)?;

        Ok(ScanResult {
            source: source.to_string(),
            ledger: ledger.path().to_string(),
            files: total,
            matched,
            unmatched,
            written: records.len(),
        })
    }

    /// Uploads every selected record of the file list that hasn't been
    /// uploaded yet, verifies each transfer and writes the statuses back.
    pub fn upload(
        &self,
        ledger: &Ledger,
        options: UploadOptions,
        sink: &dyn ProgressSink,
    ) -> Result<UploadResult, KiraError> {
        let mut records = ledger.load(&self.matcher)?;
        for record in records.iter_mut().filter(|r| r.is_pending_upload()) {
            record.reset_status();
        }

        let batches = Collator::new(options.strict_scan_ids).collate(&mut records);
        sink.event(ProgressEvent {
            message: format!("phase=Collate; {} batches", batches.len()),
            elapsed: None,
        });

        let mut result = UploadResult::default();
        if options.dry_run {
            for upload in batches.values() {
                upload.log(&records);
                result.batches.push(upload.summary(0, 0, 0));
            }
            return Ok(result);
        }

        for (_, mut upload) in batches {
            if self.interrupt_confirmed(sink) {
                return self.stop(ledger, &mut records, result);
            }
            match self.upload_batch(&mut upload, &mut records, &options, sink) {
                Ok(BatchOutcome::Done(summary)) => result.push(summary),
                Ok(BatchOutcome::Interrupted(summary)) => {
                    result.push(summary);
                    return self.stop(ledger, &mut records, result);
                }
                Err(err) if err.is_fatal_for_run() => {
                    tracing::error!(batch = %upload.key(), %err, "aborting upload");
                    let reason = format!("aborted: {err}");
                    for record in records.iter_mut().filter(|r| is_unfinished(r)) {
                        record.mark_failed(reason.clone());
                    }
                    ledger.save(&records, &self.matcher)?;
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(batch = %upload.key(), %err, "batch failed");
                    let mut failed = 0;
                    for &index in upload.files() {
                        let record = &mut records[index];
                        if record.status == Status::Pending {
                            record.mark_failed(err.to_string());
                        }
                        if record.status == Status::Failed {
                            failed += 1;
                        }
                    }
                    result.push(upload.summary(0, 0, failed));
                }
            }
            ledger.save(&records, &self.matcher)?;
        }

        ledger.save(&records, &self.matcher)?;
        Ok(result)
    }

    fn upload_batch(
        &self,
        upload: &mut Upload,
        records: &mut [FileMatch],
        options: &UploadOptions,
        sink: &dyn ProgressSink,
    ) -> Result<BatchOutcome, KiraError> {
        let start = Instant::now();
        upload.log(records);
        sink.event(ProgressEvent {
            message: format!("phase=Upload; {}", upload.key()),
            elapsed: None,
        });

        upload.activate(&self.transport, &options.project)?;
        let remote = upload.remote_files(&self.transport)?;

        let mut attempted = Vec::new();
        let mut resumed = Vec::new();
        let mut interrupted = false;
        for &index in upload.files() {
            if self.interrupt_confirmed(sink) {
                interrupted = true;
                break;
            }
            let record = &mut records[index];
            let name = record.filename().to_string();
            let existing = remote.get(&name);
            if let Some(remote_digest) = existing {
                if !options.overwrite {
                    match file_md5(&record.file) {
                        Ok(local) if local.eq_ignore_ascii_case(remote_digest) => {
                            tracing::debug!(file = %record.file, "already in archive");
                            resumed.push(index);
                            attempted.push(index);
                            continue;
                        }
                        Ok(_) => {}
                        Err(err) => {
                            record.mark_failed(err.to_string());
                            continue;
                        }
                    }
                }
            }
            match upload.upload_file(&self.transport, record, existing.is_some()) {
                Ok(()) => attempted.push(index),
                Err(err) if err.is_fatal_for_run() => return Err(err),
                Err(err) => {
                    tracing::warn!(file = %record.file, %err, "upload failed");
                    record.mark_failed(err.to_string());
                }
            }
        }

        if !attempted.is_empty() {
            if let Err(err) = upload.verify(&self.transport, records, &attempted) {
                if !interrupted || err.is_fatal_for_run() {
                    return Err(err);
                }
                // Unverified files stay pending and are marked interrupted.
                tracing::warn!(batch = %upload.key(), %err, "verification after interrupt failed");
            }
        }

        let mut uploaded = 0;
        let mut skipped = 0;
        let mut failed = 0;
        for &index in upload.files() {
            match records[index].status {
                Status::Success if resumed.contains(&index) => skipped += 1,
                Status::Success => uploaded += 1,
                Status::Failed => failed += 1,
                _ => {}
            }
        }
        sink.event(ProgressEvent {
            message: format!(
                "phase=Verify; {} uploaded={uploaded} skipped={skipped} failed={failed}",
                upload.key()
            ),
            elapsed: Some(start.elapsed()),
        });

        let summary = upload.summary(uploaded, skipped, failed);
        if interrupted {
            Ok(BatchOutcome::Interrupted(summary))
        } else {
            Ok(BatchOutcome::Done(summary))
        }
    }

    fn interrupt_confirmed(&self, sink: &dyn ProgressSink) -> bool {
        if !self.interrupt.is_requested() {
            return false;
        }
        if sink.confirm_interrupt() {
            return true;
        }
        tracing::info!("interrupt declined, continuing");
        self.interrupt.clear();
        false
    }

    fn stop(
        &self,
        ledger: &Ledger,
        records: &mut [FileMatch],
        mut result: UploadResult,
    ) -> Result<UploadResult, KiraError> {
        let mut pending = 0;
        for record in records.iter_mut().filter(|r| is_unfinished(r)) {
            record.mark_interrupted();
            pending += 1;
        }
        tracing::warn!(pending, "upload interrupted");
        ledger.save(records, &self.matcher)?;
        result.interrupted = true;
        Ok(result)
    }
}

fn is_unfinished(record: &FileMatch) -> bool {
    record.status == Status::Pending && record.is_pending_upload()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Declining;

    impl ProgressSink for Declining {
        fn event(&self, _event: ProgressEvent) {}

        fn confirm_interrupt(&self) -> bool {
            false
        }
    }

    #[test]
    fn interrupt_flag_is_shared() {
        let interrupt = Interrupt::new();
        let handle = interrupt.clone();
        handle.request();
        assert!(interrupt.is_requested());
        interrupt.clear();
        assert!(!handle.is_requested());
    }

    #[test]
    fn upload_result_totals() {
        let mut result = UploadResult::default();
        for (uploaded, skipped, failed) in [(2, 1, 0), (0, 0, 3)] {
            result.push(UploadSummary {
                key: "k".to_string(),
                session_label: "s".to_string(),
                subject: "x".to_string(),
                dataset: "d".to_string(),
                files: uploaded + skipped + failed,
                uploaded,
                skipped,
                failed,
            });
        }
        assert_eq!((result.uploaded, result.skipped, result.failed), (2, 1, 3));
        assert_eq!(result.batches.len(), 2);
    }

    #[test]
    fn declined_interrupt_is_cleared() {
        use crate::extract::NullExtractor;
        use crate::matcher::HierarchyMapping;
        use crate::recipe::Recipe;
        use indexmap::IndexMap;

        struct Offline;
        impl ArchiveTransport for Offline {
            fn resource(
                &self,
                _spec: &crate::transport::ResourceSpec,
            ) -> Result<crate::transport::ResourceHandle, KiraError> {
                Err(KiraError::Transport("offline".to_string()))
            }
            fn list_files(
                &self,
                _handle: &crate::transport::ResourceHandle,
            ) -> Result<std::collections::BTreeMap<String, String>, KiraError> {
                Err(KiraError::Transport("offline".to_string()))
            }
            fn upload_file(
                &self,
                _handle: &crate::transport::ResourceHandle,
                _local: &Utf8Path,
                _remote_name: &str,
                _overwrite: bool,
            ) -> Result<(), KiraError> {
                Err(KiraError::Transport("offline".to_string()))
            }
        }

        let mut recipes = IndexMap::new();
        recipes.insert("A".to_string(), Recipe::compile(&["{ID}", "{File}"]).unwrap());
        let mapping = HierarchyMapping {
            subject: vec!["ID".to_string()],
            session: vec!["ID".to_string()],
            dataset: vec!["File".to_string()],
        };
        let matcher = Matcher::new(recipes, mapping, &[]).unwrap();
        let app = App::new(matcher, Offline, NullExtractor);
        app.interrupt().request();
        assert!(!app.interrupt_confirmed(&Declining));
        assert!(!app.interrupt().is_requested());
    }
}
