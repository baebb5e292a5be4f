use std::io::{self, BufRead, Write};

use serde::Serialize;

use crate::app::{ProgressEvent, ProgressSink, ScanResult, UploadResult};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_scan(result: &ScanResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_upload(result: &UploadResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Progress lines on stderr; asks before acting on Ctrl-C.
pub struct ConsoleSink;

impl ProgressSink for ConsoleSink {
    fn event(&self, event: ProgressEvent) {
        let mut stderr = io::stderr();
        let _ = match event.elapsed {
            Some(elapsed) => writeln!(
                stderr,
                "{} ({:.1}s)",
                event.message,
                elapsed.as_secs_f64()
            ),
            None => writeln!(stderr, "{}", event.message),
        };
    }

    fn confirm_interrupt(&self) -> bool {
        let mut stderr = io::stderr();
        let _ = write!(stderr, "Stop the upload after the current file? [y/N] ");
        let _ = stderr.flush();
        let mut answer = String::new();
        match io::stdin().lock().read_line(&mut answer) {
            Ok(0) | Err(_) => true,
            Ok(_) => matches!(answer.trim(), "y" | "Y" | "yes" | "Yes"),
        }
    }
}

pub fn print_upload_summary(result: &UploadResult) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let red = "\x1b[31m";
    let reset = "\x1b[0m";

    println!("{green}Uploaded: {}{reset}", result.uploaded);
    println!("{yellow}Already in archive: {}{reset}", result.skipped);
    println!("{red}Failed: {}{reset}", result.failed);
    for batch in &result.batches {
        let color = if batch.failed > 0 { red } else { green };
        println!(
            "{color}  {} ({} files: {} uploaded, {} skipped, {} failed){reset}",
            batch.key, batch.files, batch.uploaded, batch.skipped, batch.failed
        );
    }
    if result.interrupted {
        println!("{yellow}Interrupted; rerun upload to resume.{reset}");
    }
}

pub fn print_scan_summary(result: &ScanResult) {
    println!(
        "Scanned {} files under {}: {} matched, {} unmatched",
        result.files, result.source, result.matched, result.unmatched
    );
    println!("Wrote {} rows to {}", result.written, result.ledger);
}
