use std::io::Read;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Deserialize;

use epitaph_core::models::Subject;

/// `id,name,birthday,deathday,cause_of_death` with ISO dates; every column
/// after `name` may be empty. Subjects without a death date are still
/// imported and later skipped as invalid by the batch.
#[derive(Debug, Deserialize)]
struct SubjectRow {
    id: i64,
    name: String,
    #[serde(default)]
    birthday: Option<NaiveDate>,
    #[serde(default)]
    deathday: Option<NaiveDate>,
    #[serde(default)]
    cause_of_death: Option<String>,
}

pub fn read_subjects<R: Read>(reader: R) -> Result<Vec<Subject>> {
    let mut csv = csv::Reader::from_reader(reader);
    let mut subjects = Vec::new();
    for (line, row) in csv.deserialize::<SubjectRow>().enumerate() {
        let row = row.with_context(|| format!("Invalid subject row {}", line + 2))?;
        let mut subject = Subject::new(row.id, row.name.trim());
        subject.birthday = row.birthday;
        subject.deathday = row.deathday;
        subject.cause_of_death = row.cause_of_death.filter(|c| !c.trim().is_empty());
        subjects.push(subject);
    }
    Ok(subjects)
}
