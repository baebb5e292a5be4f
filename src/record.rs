use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::error::KiraError;
use crate::matcher::Matcher;

/// Modality recorded for files the extractor could not classify ("Other").
pub const DEFAULT_MODALITY: &str = "OT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Pending,
    Matched,
    Unmatched,
    Success,
    Failed,
    Interrupted,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "",
            Status::Matched => "matched",
            Status::Unmatched => "unmatched",
            Status::Success => "success",
            Status::Failed => "failed",
            Status::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "" => Ok(Status::Pending),
            "matched" => Ok(Status::Matched),
            "unmatched" => Ok(Status::Unmatched),
            "success" => Ok(Status::Success),
            "failed" => Ok(Status::Failed),
            "interrupted" => Ok(Status::Interrupted),
            other => Err(KiraError::Ledger(format!("unknown status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Hierarchy {
    pub subject: String,
    pub session: String,
    pub dataset: String,
}

/// One file's matching, extraction and upload state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMatch {
    pub label: Option<String>,
    pub file: Utf8PathBuf,
    pub selected: bool,
    pub status: Status,
    pub error: Option<String>,
    pub session_label: Option<String>,
    pub hierarchy: Option<Hierarchy>,
    pub extracted: BTreeMap<String, String>,
    pub values: BTreeMap<String, String>,
}

impl FileMatch {
    pub fn new(file: Utf8PathBuf) -> Self {
        Self {
            label: None,
            file,
            selected: false,
            status: Status::Pending,
            error: None,
            session_label: None,
            hierarchy: None,
            extracted: BTreeMap::new(),
            values: BTreeMap::new(),
        }
    }

    pub fn filename(&self) -> &str {
        self.file.file_name().unwrap_or(self.file.as_str())
    }

    pub fn subject(&self) -> Option<&str> {
        self.hierarchy.as_ref().map(|h| h.subject.as_str())
    }

    pub fn session(&self) -> Option<&str> {
        self.hierarchy.as_ref().map(|h| h.session.as_str())
    }

    pub fn dataset(&self) -> Option<&str> {
        self.hierarchy.as_ref().map(|h| h.dataset.as_str())
    }

    /// The session hierarchy value, falling back to the extracted study date.
    pub fn study_date(&self) -> &str {
        match self.session() {
            Some(session) if !session.is_empty() => session,
            _ => self.extracted_value("StudyDate").unwrap_or_default(),
        }
    }

    pub fn modality(&self) -> &str {
        self.extracted_value("Modality").unwrap_or(DEFAULT_MODALITY)
    }

    pub fn series_number(&self) -> Option<&str> {
        self.extracted_value("SeriesNumber")
    }

    pub fn manufacturer(&self) -> Option<&str> {
        self.extracted_value("Manufacturer")
    }

    pub fn model(&self) -> Option<&str> {
        self.extracted_value("ManufacturerModelName")
    }

    fn extracted_value(&self, field: &str) -> Option<&str> {
        self.extracted
            .get(field)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
    }

    pub fn is_uploaded(&self) -> bool {
        self.status == Status::Success
    }

    /// Selected, matched and not yet uploaded.
    pub fn is_pending_upload(&self) -> bool {
        self.selected && self.hierarchy.is_some() && !self.is_uploaded()
    }

    pub fn mark_unmatched(&mut self, reason: impl Into<String>) {
        self.selected = false;
        self.status = Status::Unmatched;
        self.error = Some(reason.into());
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = Status::Failed;
        self.error = Some(reason.into());
    }

    pub fn mark_success(&mut self) {
        self.status = Status::Success;
        self.error = None;
    }

    pub fn mark_interrupted(&mut self) {
        self.status = Status::Interrupted;
        self.error = None;
    }

    pub fn reset_status(&mut self) {
        self.status = Status::Pending;
        self.error = None;
    }

    fn status_column(&self) -> String {
        match &self.error {
            Some(error) => format!("{}: {error}", self.status),
            None => self.status.to_string(),
        }
    }

    /// Flat row in the matcher's header order.
    pub fn to_row(&self, matcher: &Matcher) -> Vec<String> {
        let mut row = vec![
            self.label.clone().unwrap_or_default(),
            self.file.to_string(),
            self.filename().to_string(),
            if self.selected { "Y" } else { "N" }.to_string(),
            self.status_column(),
            self.session_label.clone().unwrap_or_default(),
        ];
        match &self.hierarchy {
            Some(h) => row.extend([h.subject.clone(), h.session.clone(), h.dataset.clone()]),
            None => row.extend([String::new(), String::new(), String::new()]),
        }
        for field in matcher.extract_fields() {
            row.push(self.extracted.get(field).cloned().unwrap_or_default());
        }
        for param in matcher.params() {
            row.push(self.values.get(param).cloned().unwrap_or_default());
        }
        row
    }

    pub fn from_row(matcher: &Matcher, row: &[String]) -> Result<Self, KiraError> {
        let expected = matcher.headers().len();
        if row.len() != expected {
            return Err(KiraError::Ledger(format!(
                "row has {} columns, expected {expected}",
                row.len()
            )));
        }
        let mut record = FileMatch::new(Utf8PathBuf::from(&row[1]));
        record.label = non_empty(&row[0]);
        record.selected = row[3] == "Y";
        let (status, error) = parse_status_column(&row[4])?;
        record.status = status;
        record.error = error;
        record.session_label = non_empty(&row[5]);
        if row[6..9].iter().any(|value| !value.is_empty()) {
            record.hierarchy = Some(Hierarchy {
                subject: row[6].clone(),
                session: row[7].clone(),
                dataset: row[8].clone(),
            });
        }

        let mut column = 9;
        for field in matcher.extract_fields() {
            if !row[column].is_empty() {
                record.extracted.insert(field.clone(), row[column].clone());
            }
            column += 1;
        }
        for param in matcher.params() {
            if !row[column].is_empty() {
                record.values.insert(param.clone(), row[column].clone());
            }
            column += 1;
        }
        Ok(record)
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_status_column(value: &str) -> Result<(Status, Option<String>), KiraError> {
    if let Some((status, error)) = value.split_once(": ") {
        if let Ok(status) = status.parse::<Status>() {
            return Ok((status, Some(error.to_string())));
        }
    }
    Ok((value.parse()?, None))
}
