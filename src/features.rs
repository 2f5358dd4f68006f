use tracing::debug;

use crate::models::{DerivedFeatures, StudentRecord};

/// Largest absence count in the batch; zero for an empty batch.
pub fn max_absences(records: &[StudentRecord]) -> u32 {
    records.iter().map(|r| r.absences).max().unwrap_or(0)
}

pub fn attendance_pct(absences: u32, max_absences: u32) -> f64 {
    if max_absences == 0 {
        return 100.0;
    }
    (1.0 - absences as f64 / max_absences as f64) * 100.0
}

pub fn missing_assignments(record: &StudentRecord) -> u8 {
    u8::from(record.failures > 0 || record.studytime <= 1)
}

pub fn derive(record: &StudentRecord, max_absences: u32) -> DerivedFeatures {
    DerivedFeatures {
        attendance_pct: attendance_pct(record.absences, max_absences),
        final_grade: f64::from(record.g3),
        trend_recent: f64::from(record.g3) - f64::from(record.g2),
        missing_assignments: missing_assignments(record),
    }
}

/// Derives features for every record, in input order.
pub fn derive_batch(records: &[StudentRecord]) -> Vec<DerivedFeatures> {
    let max = max_absences(records);
    debug!(max_absences = max, records = records.len(), "deriving features");
    records.iter().map(|record| derive(record, max)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(absences: u32, g2: i32, g3: i32, failures: u32, studytime: u32) -> StudentRecord {
        StudentRecord {
            student_id: 0,
            absences,
            g1: g2,
            g2,
            g3,
            failures,
            studytime,
        }
    }

    #[test]
    fn attendance_scales_against_batch_maximum() {
        assert_eq!(attendance_pct(0, 20), 100.0);
        assert_eq!(attendance_pct(5, 20), 75.0);
        assert_eq!(attendance_pct(20, 20), 0.0);
    }

    #[test]
    fn zero_max_absences_means_full_attendance() {
        let records = vec![record(0, 10, 12, 0, 2), record(0, 8, 6, 1, 1)];
        let features = derive_batch(&records);
        assert!(features.iter().all(|f| f.attendance_pct == 100.0));
    }

    #[test]
    fn trend_is_signed_and_grade_passes_through() {
        let features = derive(&record(3, 11, 9, 0, 3), 10);
        assert_eq!(features.final_grade, 9.0);
        assert_eq!(features.trend_recent, -2.0);
    }

    #[test]
    fn trend_at_integer_extremes_does_not_overflow() {
        let features = derive(&record(0, -1, i32::MAX, 0, 2), 0);
        assert_eq!(features.trend_recent, f64::from(i32::MAX) + 1.0);
        let features = derive(&record(0, i32::MAX, i32::MIN, 0, 2), 0);
        assert_eq!(features.trend_recent, f64::from(i32::MIN) - f64::from(i32::MAX));
    }

    #[test]
    fn missing_assignments_flags_failures_or_low_study_time() {
        assert_eq!(missing_assignments(&record(0, 10, 10, 0, 2)), 0);
        assert_eq!(missing_assignments(&record(0, 10, 10, 1, 4)), 1);
        assert_eq!(missing_assignments(&record(0, 10, 10, 0, 1)), 1);
    }
}
