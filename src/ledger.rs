//! File list kept between `scan` and `upload`.
//!
//! Stored as JSON lines: the first line is the header array, every following
//! line is one record's row. The file is always rewritten through a
//! temporary file in the same directory.

use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::KiraError;
use crate::matcher::Matcher;
use crate::record::FileMatch;

#[derive(Debug, Clone)]
pub struct Ledger {
    path: Utf8PathBuf,
}

impl Ledger {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.as_std_path().exists()
    }

    pub fn save(&self, records: &[FileMatch], matcher: &Matcher) -> Result<(), KiraError> {
        let mut content = Vec::new();
        write_line(&mut content, matcher.headers())?;
        for record in records {
            write_line(&mut content, &record.to_row(matcher))?;
        }
        write_atomic(&self.path, &content)?;
        tracing::debug!(path = %self.path, rows = records.len(), "saved file list");
        Ok(())
    }

    pub fn load(&self, matcher: &Matcher) -> Result<Vec<FileMatch>, KiraError> {
        let content = fs::read_to_string(self.path.as_std_path())
            .map_err(|err| KiraError::Ledger(format!("{}: {err}", self.path)))?;
        let mut lines = content.lines().enumerate().filter(|(_, line)| !line.trim().is_empty());

        let Some((_, header_line)) = lines.next() else {
            return Err(KiraError::Ledger(format!("{} is empty", self.path)));
        };
        let header = parse_line(header_line, 1)?;
        if header != matcher.headers() {
            return Err(KiraError::Ledger(format!(
                "{} was written for a different configuration; rescan to rebuild it",
                self.path
            )));
        }

        let mut records = Vec::new();
        for (index, line) in lines {
            let row = parse_line(line, index + 1)?;
            let record = FileMatch::from_row(matcher, &row)
                .map_err(|err| KiraError::Ledger(format!("line {}: {err}", index + 1)))?;
            records.push(record);
        }
        Ok(records)
    }
}

fn write_line(out: &mut Vec<u8>, row: &[String]) -> Result<(), KiraError> {
    serde_json::to_writer(&mut *out, row).map_err(|err| KiraError::Ledger(err.to_string()))?;
    out.push(b'\n');
    Ok(())
}

fn parse_line(line: &str, number: usize) -> Result<Vec<String>, KiraError> {
    serde_json::from_str(line).map_err(|err| KiraError::Ledger(format!("line {number}: {err}")))
}

fn write_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), KiraError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".kira-xu-ledger")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    Ok(())
}
