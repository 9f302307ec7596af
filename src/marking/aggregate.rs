/// Aggregate artifacts: overall JSON, marking CSV and the no-result listing
use crate::config::types::Result;
use crate::marking::result::ResultRecord;
use chrono::{DateTime, Local};
use log::info;
use serde::Serialize;
use serde_json::Value;
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Paths of the files written by one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifacts {
    pub json: PathBuf,
    pub csv: PathBuf,
    pub no_results: Option<PathBuf>,
}

pub fn timestamp(at: &DateTime<Local>) -> String {
    at.format("%Y%m%d_%H%M%S").to_string()
}

/// Create `<stem>_<ts>.<ext>` without ever replacing an existing file
fn create_unique(dir: &Path, stem: &str, ts: &str, ext: &str) -> Result<(File, PathBuf)> {
    let mut attempt = 0usize;
    loop {
        let name = if attempt == 0 {
            format!("{}_{}.{}", stem, ts, ext)
        } else {
            format!("{}_{}_{}.{}", stem, ts, attempt, ext)
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((file, path)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Union of test names across records, sorted
pub fn test_names(records: &[ResultRecord]) -> Vec<String> {
    let names: BTreeSet<&String> = records
        .iter()
        .filter_map(|r| r.tests.as_ref())
        .flat_map(|tests| tests.keys())
        .collect();
    names.into_iter().cloned().collect()
}

/// Union of detail keys across records, sorted
pub fn detail_keys(records: &[ResultRecord]) -> Vec<String> {
    let keys: BTreeSet<&String> = records
        .iter()
        .filter_map(|r| r.details.as_ref())
        .flat_map(|details| details.keys())
        .collect();
    keys.into_iter().cloned().collect()
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

fn format_detail(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() => format_number(f),
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

/// RFC 4180 field quoting
fn escape_field(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

fn write_row<W: Write>(out: &mut W, fields: &[String]) -> std::io::Result<()> {
    let line = fields
        .iter()
        .map(|f| escape_field(f))
        .collect::<Vec<_>>()
        .join(",");
    out.write_all(line.as_bytes())?;
    out.write_all(b"\r\n")
}

/// Render the marking CSV for records that have results, sorted by submission
pub fn render_csv<W: Write>(out: &mut W, records: &[ResultRecord]) -> std::io::Result<()> {
    let names = test_names(records);
    let keys = detail_keys(records);

    let mut header = vec!["submission".to_string()];
    header.extend(names.iter().cloned());
    header.extend(keys.iter().cloned());
    header.push("mark".to_string());
    write_row(out, &header)?;

    let mut rows: Vec<&ResultRecord> = records.iter().filter(|r| r.has_results()).collect();
    rows.sort_by(|a, b| a.submission.cmp(&b.submission));

    for record in rows {
        let mut row = Vec::with_capacity(header.len());
        row.push(record.submission.clone());
        for name in &names {
            row.push(
                record
                    .tests
                    .as_ref()
                    .and_then(|tests| tests.get(name))
                    .map(|v| format_number(*v))
                    .unwrap_or_default(),
            );
        }
        for key in &keys {
            row.push(
                record
                    .details
                    .as_ref()
                    .and_then(|details| details.get(key))
                    .map(format_detail)
                    .unwrap_or_default(),
            );
        }
        row.push(format_number(record.received_marks().unwrap_or(0.0)));
        write_row(out, &row)?;
    }

    Ok(())
}

/// Submissions without a usable record, sorted
pub fn no_result_ids(records: &[ResultRecord]) -> Vec<String> {
    let mut ids: Vec<String> = records
        .iter()
        .filter(|r| !r.has_results())
        .map(|r| r.submission.clone())
        .collect();
    ids.sort();
    ids
}

/// Write all aggregate files into `dir`, stamped with `started`
pub fn write_aggregates(
    records: &[ResultRecord],
    dir: &Path,
    started: &DateTime<Local>,
) -> Result<Artifacts> {
    std::fs::create_dir_all(dir)?;
    let ts = timestamp(started);

    let mut sorted: Vec<&ResultRecord> = records.iter().collect();
    sorted.sort_by(|a, b| a.submission.cmp(&b.submission));

    let (mut json_file, json) = create_unique(dir, "overall_results", &ts, "json")?;
    serde_json::to_writer(&mut json_file, &sorted)?;
    json_file.flush()?;

    let (mut csv_file, csv) = create_unique(dir, "marking_results", &ts, "csv")?;
    render_csv(&mut csv_file, records)?;
    csv_file.flush()?;

    let missing = no_result_ids(records);
    let no_results = if missing.is_empty() {
        None
    } else {
        let (mut file, path) = create_unique(dir, "no_results", &ts, "txt")?;
        for id in &missing {
            writeln!(file, "{}", id)?;
        }
        Some(path)
    };

    info!(
        "Wrote {} ({} records), {}{}",
        json.display(),
        records.len(),
        csv.display(),
        no_results
            .as_ref()
            .map(|p| format!(", {}", p.display()))
            .unwrap_or_default()
    );

    Ok(Artifacts {
        json,
        csv,
        no_results,
    })
}
