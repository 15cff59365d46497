//! Per-subject CSV report for `epitaph enrich --report`.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

use epitaph_core::batch::{SubjectOutcome, SubjectReport};

#[derive(Debug, Serialize)]
struct ReportRow<'a> {
    subject_id: i64,
    name: &'a str,
    outcome: &'static str,
    fields_written: usize,
    cost: f64,
    permanently_failed: bool,
    stop_reason: &'a str,
    providers: String,
    elapsed_ms: u64,
    error: &'a str,
}

impl<'a> From<&'a SubjectReport> for ReportRow<'a> {
    fn from(report: &'a SubjectReport) -> Self {
        let (fields_written, permanently_failed, error) = match &report.outcome {
            SubjectOutcome::Updated { fields, .. } => (*fields, false, ""),
            SubjectOutcome::NoNewData { .. } => (0, false, ""),
            SubjectOutcome::NotFound { permanently_failed } => (0, *permanently_failed, ""),
            SubjectOutcome::Invalid {
                reason,
                permanently_failed,
            } => (0, *permanently_failed, reason.as_str()),
            SubjectOutcome::TransientFailure {
                error,
                permanently_failed,
            } => (0, *permanently_failed, error.as_str()),
        };
        ReportRow {
            subject_id: report.subject_id,
            name: &report.name,
            outcome: report.outcome.as_str(),
            fields_written,
            cost: report.outcome.cost(),
            permanently_failed,
            stop_reason: report.stop_reason.as_deref().unwrap_or(""),
            providers: report.providers_attempted.join(";"),
            elapsed_ms: report.elapsed_ms,
            error,
        }
    }
}

/// Write one row per processed subject. Returns the number of rows.
pub fn write_report<W: Write>(writer: W, reports: &[SubjectReport]) -> Result<usize> {
    let mut csv = csv::Writer::from_writer(writer);
    for report in reports {
        csv.serialize(ReportRow::from(report))
            .with_context(|| format!("Failed to write report row for subject {}", report.subject_id))?;
    }
    csv.flush().context("Failed to flush report")?;
    Ok(reports.len())
}

pub fn write_report_file(path: &Path, reports: &[SubjectReport]) -> Result<usize> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create report file: {}", path.display()))?;
    write_report(file, reports)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(id: i64, outcome: SubjectOutcome) -> SubjectReport {
        SubjectReport {
            subject_id: id,
            name: format!("Subject {id}"),
            outcome,
            providers_attempted: vec!["wikidata".into(), "wikipedia".into()],
            stop_reason: Some("sufficient".into()),
            elapsed_ms: 12,
        }
    }

    #[test]
    fn test_report_has_header_and_one_row_per_subject() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv");
        let reports = vec![
            report(1, SubjectOutcome::Updated { fields: 2, cost: 0.01 }),
            report(
                2,
                SubjectOutcome::TransientFailure {
                    error: "timeout, retry later".into(),
                    permanently_failed: true,
                },
            ),
        ];

        assert_eq!(write_report_file(&path, &reports).unwrap(), 2);

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "subject_id");
        assert_eq!(&headers[2], "outcome");

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][2], "updated");
        assert_eq!(&rows[0][3], "2");
        assert_eq!(&rows[0][7], "wikidata;wikipedia");
        assert_eq!(&rows[1][2], "transient_failure");
        assert_eq!(&rows[1][5], "true");
        assert_eq!(&rows[1][9], "timeout, retry later");
    }

    #[test]
    fn test_empty_report_writes_nothing() {
        let mut buf = Vec::new();
        assert_eq!(write_report(&mut buf, &[]).unwrap(), 0);
        assert!(buf.is_empty());
    }
}
