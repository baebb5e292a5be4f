use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::digest::file_md5;
use crate::error::KiraError;
use crate::record::FileMatch;
use crate::transport::{ArchiveTransport, ResourceHandle, ResourceSpec};

/// Identity of a batch, fixed when the first record joins it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSpec {
    pub key: String,
    pub session_label: String,
    pub subject: String,
    pub study_date: String,
    pub modality: String,
    pub series_id: Option<String>,
    pub dataset: String,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
}

/// A group of records destined for one archive resource.
///
/// Members are indices into the record list the batch was collated from.
#[derive(Debug, Clone)]
pub struct Upload {
    spec: UploadSpec,
    strict_scan_ids: bool,
    files: Vec<usize>,
    remote_names: HashSet<String>,
    handle: Option<ResourceHandle>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadSummary {
    pub key: String,
    pub session_label: String,
    pub subject: String,
    pub dataset: String,
    pub files: usize,
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl Upload {
    pub fn new(spec: UploadSpec, strict_scan_ids: bool) -> Self {
        Self {
            spec,
            strict_scan_ids,
            files: Vec::new(),
            remote_names: HashSet::new(),
            handle: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.spec.key
    }

    pub fn spec(&self) -> &UploadSpec {
        &self.spec
    }

    pub fn files(&self) -> &[usize] {
        &self.files
    }

    pub fn handle(&self) -> Option<&ResourceHandle> {
        self.handle.as_ref()
    }

    /// Adds a record, or returns why it can't join this batch.
    pub fn add_file(&mut self, index: usize, record: &FileMatch) -> Result<(), String> {
        let series = record.series_number();
        if series != self.spec.series_id.as_deref() {
            let message = format!(
                "series number {} differs from batch series {}",
                series.unwrap_or("(none)"),
                self.spec.series_id.as_deref().unwrap_or("(none)")
            );
            if self.strict_scan_ids {
                tracing::error!(batch = %self.spec.key, file = %record.file, "{message}");
                return Err(message);
            }
            tracing::warn!(batch = %self.spec.key, file = %record.file, "{message}");
        }
        let name = record.filename().to_string();
        if !self.remote_names.insert(name.clone()) {
            let message = format!("duplicate file name {name} in {}", self.spec.key);
            tracing::error!(batch = %self.spec.key, file = %record.file, "{message}");
            return Err(message);
        }
        self.files.push(index);
        Ok(())
    }

    pub fn resource_spec(&self, project: &str) -> ResourceSpec {
        ResourceSpec {
            project: project.to_string(),
            subject: self.spec.subject.clone(),
            session_label: self.spec.session_label.clone(),
            dataset: self.spec.dataset.clone(),
            modality: self.spec.modality.clone(),
            study_date: self.spec.study_date.clone(),
            manufacturer: self.spec.manufacturer.clone(),
            model: self.spec.model.clone(),
        }
    }

    /// Gets or creates the remote resource. Only the first call talks to
    /// the archive.
    pub fn activate<T: ArchiveTransport>(
        &mut self,
        transport: &T,
        project: &str,
    ) -> Result<&ResourceHandle, KiraError> {
        if self.handle.is_none() {
            let handle = transport.resource(&self.resource_spec(project))?;
            tracing::debug!(batch = %self.spec.key, resource = %handle, "activated batch");
            self.handle = Some(handle);
        }
        self.handle
            .as_ref()
            .ok_or_else(|| KiraError::Transport("resource not activated".to_string()))
    }

    fn active_handle(&self) -> Result<&ResourceHandle, KiraError> {
        self.handle.as_ref().ok_or_else(|| {
            KiraError::Transport(format!("batch {} has no remote resource", self.spec.key))
        })
    }

    pub fn remote_files<T: ArchiveTransport>(
        &self,
        transport: &T,
    ) -> Result<BTreeMap<String, String>, KiraError> {
        transport.list_files(self.active_handle()?)
    }

    pub fn upload_file<T: ArchiveTransport>(
        &self,
        transport: &T,
        record: &FileMatch,
        overwrite: bool,
    ) -> Result<(), KiraError> {
        transport.upload_file(self.active_handle()?, &record.file, record.filename(), overwrite)
    }

    /// Compares each member in `attempted` with the remote listing and
    /// records success or the reason it failed.
    pub fn verify<T: ArchiveTransport>(
        &self,
        transport: &T,
        records: &mut [FileMatch],
        attempted: &[usize],
    ) -> Result<(), KiraError> {
        let remote = self.remote_files(transport)?;
        for &index in attempted {
            let record = &mut records[index];
            let name = record.filename().to_string();
            let Some(remote_digest) = remote.get(&name) else {
                tracing::warn!(file = %record.file, "file missing from archive after upload");
                record.mark_failed(format!("{name} missing from archive"));
                continue;
            };
            match file_md5(&record.file) {
                Ok(local) if local.eq_ignore_ascii_case(remote_digest) => {
                    tracing::info!(file = %record.file, batch = %self.spec.key, "verified");
                    record.mark_success();
                }
                Ok(local) => {
                    tracing::warn!(file = %record.file, %local, remote = %remote_digest, "digest mismatch");
                    record.mark_failed(format!("digest mismatch: {local} != {remote_digest}"));
                }
                Err(err) => record.mark_failed(err.to_string()),
            }
        }
        Ok(())
    }

    pub fn log(&self, records: &[FileMatch]) {
        tracing::info!(
            batch = %self.spec.key,
            subject = %self.spec.subject,
            modality = %self.spec.modality,
            series = self.spec.series_id.as_deref().unwrap_or(""),
            files = self.files.len(),
            "upload batch"
        );
        for &index in &self.files {
            tracing::debug!(batch = %self.spec.key, file = %records[index].file, "batch member");
        }
    }

    pub fn summary(&self, uploaded: usize, skipped: usize, failed: usize) -> UploadSummary {
        UploadSummary {
            key: self.spec.key.clone(),
            session_label: self.spec.session_label.clone(),
            subject: self.spec.subject.clone(),
            dataset: self.spec.dataset.clone(),
            files: self.files.len(),
            uploaded,
            skipped,
            failed,
        }
    }
}
