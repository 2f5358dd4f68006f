//! Loads the raw student table and validates it before any scoring runs.

use std::io::Read;
use std::ops::RangeInclusive;
use std::path::Path;

use tracing::info;

use crate::error::{Error, Result};
use crate::models::StudentRecord;

pub const REQUIRED_COLUMNS: [&str; 6] = ["absences", "G1", "G2", "G3", "failures", "studytime"];

/// Period and final grades are on the 0 to 20 scale.
pub const GRADE_SCALE: RangeInclusive<i32> = 0..=20;

pub fn read_records(path: &Path, delimiter: u8) -> Result<Vec<StudentRecord>> {
    let file = std::fs::File::open(path)?;
    let records = parse_records(file, delimiter)?;
    info!(path = %path.display(), count = records.len(), "loaded student records");
    Ok(records)
}

/// Parses a delimited table into records. Any missing column or malformed
/// cell fails the whole batch; nothing is defaulted.
pub fn parse_records<R: Read>(input: R, delimiter: u8) -> Result<Vec<StudentRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .from_reader(input);

    let headers = reader.headers()?.clone();
    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|column| !headers.iter().any(|h| h == *column))
        .collect();
    if !missing.is_empty() {
        return Err(Error::Validation(format!(
            "missing required columns: {missing:?}"
        )));
    }

    let index = |column: &str| headers.iter().position(|h| h == column).unwrap_or_default();
    let columns = REQUIRED_COLUMNS.map(index);

    let mut records = Vec::new();
    for (row, result) in reader.records().enumerate() {
        let line = result?;
        let cell = |slot: usize| -> Result<i64> {
            let name = REQUIRED_COLUMNS[slot];
            let raw = line.get(columns[slot]).unwrap_or("");
            raw.parse::<i64>().map_err(|_| {
                Error::Validation(format!(
                    "row {}: column '{name}' has invalid value '{raw}'",
                    row + 1
                ))
            })
        };
        let non_negative = |slot: usize, min: i64| -> Result<u32> {
            let value = cell(slot)?;
            u32::try_from(value)
                .ok()
                .filter(|v| i64::from(*v) >= min)
                .ok_or_else(|| {
                    Error::Validation(format!(
                        "row {}: column '{}' must be >= {min}, got {value}",
                        row + 1,
                        REQUIRED_COLUMNS[slot]
                    ))
                })
        };
        let grade = |slot: usize| -> Result<i32> {
            let value = cell(slot)?;
            i32::try_from(value)
                .ok()
                .filter(|v| GRADE_SCALE.contains(v))
                .ok_or_else(|| {
                    Error::Validation(format!(
                        "row {}: column '{}' must be within {}..={}, got {value}",
                        row + 1,
                        REQUIRED_COLUMNS[slot],
                        GRADE_SCALE.start(),
                        GRADE_SCALE.end()
                    ))
                })
        };

        records.push(StudentRecord {
            student_id: row,
            absences: non_negative(0, 0)?,
            g1: grade(1)?,
            g2: grade(2)?,
            g3: grade(3)?,
            failures: non_negative(4, 0)?,
            studytime: non_negative(5, 1)?,
        });
    }

    if records.is_empty() {
        return Err(Error::Validation("input contains no student records".to_string()));
    }
    Ok(records)
}
