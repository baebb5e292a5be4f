//! Grouping of matched records into upload batches.
//!
//! Records are partitioned by subject. Each subject's distinct study dates
//! are numbered in calendar order to give visit numbers, so the session
//! labels stay stable across reruns as long as the set of dates does.
//! Dataset names are reduced to archive-safe characters and de-duplicated
//! per subject.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::NaiveDate;

use crate::record::FileMatch;
use crate::upload::{Upload, UploadSpec};

const DATE_FORMATS: [&str; 3] = ["%Y%m%d", "%Y-%m-%d", "%Y.%m.%d"];

/// Per-subject mapping of study date to 1-based visit number.
#[derive(Debug, Clone, Default)]
pub struct VisitIndex {
    visits: HashMap<String, HashMap<String, usize>>,
}

impl VisitIndex {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a FileMatch>) -> Self {
        let mut dates: BTreeMap<String, BTreeSet<DateKey>> = BTreeMap::new();
        for record in records {
            let Some(subject) = record.subject() else {
                continue;
            };
            dates
                .entry(subject.to_string())
                .or_default()
                .insert(DateKey::new(record.study_date()));
        }
        let visits = dates
            .into_iter()
            .map(|(subject, keys)| {
                let numbered = keys
                    .into_iter()
                    .enumerate()
                    .map(|(i, key)| (key.raw, i + 1))
                    .collect();
                (subject, numbered)
            })
            .collect();
        Self { visits }
    }

    pub fn visit(&self, subject: &str, study_date: &str) -> Option<usize> {
        self.visits.get(subject)?.get(study_date).copied()
    }

    pub fn visit_count(&self, subject: &str) -> usize {
        self.visits.get(subject).map(HashMap::len).unwrap_or(0)
    }
}

/// Sort key for study dates: parseable dates in calendar order first, then
/// anything else in text order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct DateKey {
    unparsed: bool,
    date: Option<NaiveDate>,
    raw: String,
}

impl DateKey {
    fn new(raw: &str) -> Self {
        let date = DATE_FORMATS
            .iter()
            .find_map(|format| NaiveDate::parse_from_str(raw.trim(), format).ok());
        Self {
            unparsed: date.is_none(),
            date,
            raw: raw.to_string(),
        }
    }
}

pub fn is_safe_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == '-'
}

pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|ch| if is_safe_char(ch) { ch } else { '_' })
        .collect()
}

/// Sanitized, unique names for a set of originals.
///
/// Originals that are already safe keep their name. The others are assigned
/// in sorted order; a sanitized name that is already taken gets the lowest
/// free numeric suffix starting at 2.
pub fn unique_names<'a>(originals: impl IntoIterator<Item = &'a str>) -> HashMap<String, String> {
    let sorted: BTreeSet<&str> = originals.into_iter().collect();
    let mut used: HashSet<String> = HashSet::new();
    let mut names = HashMap::new();
    for &original in sorted.iter().filter(|o| sanitize(o) == **o) {
        used.insert(original.to_string());
        names.insert(original.to_string(), original.to_string());
    }
    for &original in sorted.iter().filter(|o| sanitize(o) != **o) {
        let base = sanitize(original);
        let mut candidate = base.clone();
        let mut suffix = 2;
        while used.contains(&candidate) {
            candidate = format!("{base}{suffix}");
            suffix += 1;
        }
        used.insert(candidate.clone());
        names.insert(original.to_string(), candidate);
    }
    names
}

pub fn session_label(subject: &str, modality: &str, visit: usize, series: Option<&str>) -> String {
    let label = match series {
        Some(series) => format!("{subject}_{modality}{visit}_{series}"),
        None => format!("{subject}_{modality}{visit}"),
    };
    sanitize(&label)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Collator {
    strict_scan_ids: bool,
}

impl Collator {
    pub fn new(strict_scan_ids: bool) -> Self {
        Self { strict_scan_ids }
    }

    /// Builds upload batches, keyed by `session_label:dataset`, from every
    /// selected record that hasn't been uploaded yet. Sets each collated
    /// record's session label. Records a batch refuses are marked failed.
    ///
    /// Visit numbers, subject labels and dataset names are derived from all
    /// selected records, uploaded ones included, so a resumed run reuses the
    /// labels of the first one. Subjects whose names sanitize to the same
    /// label get distinct labels.
    pub fn collate(&self, records: &mut [FileMatch]) -> BTreeMap<String, Upload> {
        let mut by_subject: BTreeMap<String, (Vec<usize>, Vec<usize>)> = BTreeMap::new();
        for (index, record) in records.iter().enumerate() {
            if !record.selected {
                continue;
            }
            let Some(subject) = record.subject() else {
                continue;
            };
            let (known, pending) = by_subject.entry(subject.to_string()).or_default();
            known.push(index);
            if record.is_pending_upload() {
                pending.push(index);
            }
        }

        let subject_labels = unique_names(by_subject.keys().map(String::as_str));
        let mut uploads: BTreeMap<String, Upload> = BTreeMap::new();
        for (subject, (known, pending)) in by_subject {
            if pending.is_empty() {
                continue;
            }
            let subject_label = subject_labels
                .get(&subject)
                .cloned()
                .unwrap_or_else(|| sanitize(&subject));
            let visits = VisitIndex::from_records(known.iter().map(|&i| &records[i]));
            let datasets = unique_names(known.iter().filter_map(|&i| records[i].dataset()));
            tracing::debug!(
                subject = %subject,
                files = pending.len(),
                visits = visits.visit_count(&subject),
                "collating subject"
            );

            for index in pending {
                let record = &records[index];
                let visit = visits.visit(&subject, record.study_date()).unwrap_or(1);
                let series = if self.strict_scan_ids {
                    record.series_number().map(str::to_string)
                } else {
                    None
                };
                let label = session_label(&subject_label, record.modality(), visit, series.as_deref());
                let original = record.dataset().unwrap_or_default();
                let dataset = datasets
                    .get(original)
                    .cloned()
                    .unwrap_or_else(|| sanitize(original));
                let key = format!("{label}:{dataset}");

                let upload = uploads.entry(key.clone()).or_insert_with(|| {
                    Upload::new(
                        UploadSpec {
                            key,
                            session_label: label.clone(),
                            subject: subject.clone(),
                            study_date: record.study_date().to_string(),
                            modality: record.modality().to_string(),
                            series_id: record.series_number().map(str::to_string),
                            dataset,
                            manufacturer: record.manufacturer().map(str::to_string),
                            model: record.model().map(str::to_string),
                        },
                        self.strict_scan_ids,
                    )
                });
                let accepted = if upload.spec().subject == subject {
                    upload.add_file(index, record)
                } else {
                    Err(format!(
                        "batch {} belongs to subject {}",
                        upload.key(),
                        upload.spec().subject
                    ))
                };
                let record = &mut records[index];
                record.session_label = Some(label);
                if let Err(reason) = accepted {
                    record.mark_failed(reason);
                }
            }
        }
        uploads
    }
}
