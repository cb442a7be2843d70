use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

pub const DEFAULT_LATE_FEE_PER_DAY: i64 = 5;

/// Weights are user-entered decimals; "sums to 100" is checked with this slack.
const WEIGHT_EPSILON: f64 = 1e-9;

const DATETIME_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CalcError {
    #[error("invalid exam component {component_id}: {reason}")]
    InvalidComponent {
        component_id: String,
        reason: String,
    },
    #[error("more than one mark supplied for exam component {component_id}")]
    DuplicateComponentMark { component_id: String },
    #[error("invalid date: {0}")]
    InvalidDate(String),
}

impl CalcError {
    pub fn code(&self) -> &'static str {
        match self {
            CalcError::InvalidComponent { .. } => "invalid_component",
            CalcError::DuplicateComponentMark { .. } => "duplicate_component_mark",
            CalcError::InvalidDate(_) => "invalid_date",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Grade {
    A,
    B,
    C,
    F,
}

impl Grade {
    pub fn is_pass(self) -> bool {
        self != Grade::F
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeThresholds {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl Default for GradeThresholds {
    fn default() -> Self {
        Self {
            a: 85.0,
            b: 70.0,
            c: 50.0,
        }
    }
}

impl GradeThresholds {
    pub fn grade_for(&self, normalized_total: f64) -> Grade {
        if normalized_total >= self.a {
            Grade::A
        } else if normalized_total >= self.b {
            Grade::B
        } else if normalized_total >= self.c {
            Grade::C
        } else {
            Grade::F
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let all_finite = self.a.is_finite() && self.b.is_finite() && self.c.is_finite();
        if !all_finite || self.a > 100.0 || self.c < 0.0 {
            return Err("grade thresholds must lie within 0..=100".to_string());
        }
        if !(self.a > self.b && self.b > self.c) {
            return Err("grade thresholds must be strictly descending (a > b > c)".to_string());
        }
        Ok(())
    }
}

/// Effective grading and fee constants for one workspace.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalcConfig {
    pub grade_thresholds: GradeThresholds,
    pub late_fee_per_day: i64,
}

impl Default for CalcConfig {
    fn default() -> Self {
        Self {
            grade_thresholds: GradeThresholds::default(),
            late_fee_per_day: DEFAULT_LATE_FEE_PER_DAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamComponent {
    pub id: String,
    pub max_mark: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentMark {
    pub component_id: String,
    pub marks_obtained: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeResult {
    pub normalized_total: f64,
    pub grade: Option<Grade>,
    pub total_weight: f64,
}

impl GradeResult {
    pub fn is_complete(&self) -> bool {
        is_full_weight(self.total_weight)
    }
}

pub fn is_full_weight(total_weight: f64) -> bool {
    (total_weight - 100.0).abs() <= WEIGHT_EPSILON
}

/// Would adding `extra` on top of `recorded` push a subject past 100% weight?
pub fn exceeds_full_weight(recorded: f64, extra: f64) -> bool {
    recorded + extra > 100.0 + WEIGHT_EPSILON
}

fn validate_component(c: &ExamComponent) -> Result<(), CalcError> {
    if !c.max_mark.is_finite() || c.max_mark <= 0.0 {
        return Err(CalcError::InvalidComponent {
            component_id: c.id.clone(),
            reason: format!("max mark must be > 0 (got {})", c.max_mark),
        });
    }
    if !c.weight.is_finite() || !(0.0..=100.0).contains(&c.weight) {
        return Err(CalcError::InvalidComponent {
            component_id: c.id.clone(),
            reason: format!("weight must be within 0..=100 (got {})", c.weight),
        });
    }
    Ok(())
}

/// Weighted 0-100 total for one (student, subject). A letter grade is only
/// produced once the recorded components add up to exactly 100% weight.
pub fn compute_grade(
    components: &[ExamComponent],
    marks: &[ComponentMark],
    thresholds: &GradeThresholds,
) -> Result<GradeResult, CalcError> {
    let mut by_id: HashMap<&str, &ExamComponent> = HashMap::with_capacity(components.len());
    for c in components {
        validate_component(c)?;
        if by_id.insert(c.id.as_str(), c).is_some() {
            return Err(CalcError::InvalidComponent {
                component_id: c.id.clone(),
                reason: "component listed more than once".to_string(),
            });
        }
    }

    let mut seen: HashSet<&str> = HashSet::with_capacity(marks.len());
    for m in marks {
        if !seen.insert(m.component_id.as_str()) {
            return Err(CalcError::DuplicateComponentMark {
                component_id: m.component_id.clone(),
            });
        }
    }

    let mut normalized_total = 0.0_f64;
    let mut total_weight = 0.0_f64;
    for m in marks {
        let Some(c) = by_id.get(m.component_id.as_str()) else {
            continue;
        };
        normalized_total += (m.marks_obtained / c.max_mark) * c.weight;
        total_weight += c.weight;
    }

    let grade = if is_full_weight(total_weight) {
        Some(thresholds.grade_for(normalized_total))
    } else {
        None
    };

    Ok(GradeResult {
        normalized_total,
        grade,
        total_weight,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BorrowingStatus {
    Returned,
    Overdue,
    Borrowed,
}

impl BorrowingStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "returned" => Some(Self::Returned),
            "overdue" => Some(Self::Overdue),
            "borrowed" => Some(Self::Borrowed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BorrowingEvaluation {
    pub days_late: i64,
    pub fee: i64,
    pub status: BorrowingStatus,
}

/// Accepts a bare date or a date-time and keeps only the calendar date.
pub fn parse_calc_date(raw: &str) -> Result<NaiveDate, CalcError> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(CalcError::InvalidDate("missing date".to_string()));
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(d);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.date_naive());
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(dt.date());
        }
    }
    Err(CalcError::InvalidDate(format!("unparsable date: {}", s)))
}

pub fn evaluate_borrowing(
    due: NaiveDate,
    actual_return: Option<NaiveDate>,
    today: NaiveDate,
    fee_per_day: i64,
) -> BorrowingEvaluation {
    let reference = actual_return.unwrap_or(today);
    let days_late = (reference - due).num_days().max(0);
    let fee = days_late.saturating_mul(fee_per_day.max(0));
    let status = if actual_return.is_some() {
        BorrowingStatus::Returned
    } else if today > due {
        BorrowingStatus::Overdue
    } else {
        BorrowingStatus::Borrowed
    };
    BorrowingEvaluation {
        days_late,
        fee,
        status,
    }
}

/// Validated date pair of one borrowing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BorrowingDates {
    pub due: NaiveDate,
    pub actual_return: Option<NaiveDate>,
}

impl BorrowingDates {
    pub fn parse(due: Option<&str>, actual_return: Option<&str>) -> Result<Self, CalcError> {
        let Some(due_raw) = due else {
            return Err(CalcError::InvalidDate("due date is required".to_string()));
        };
        let due = parse_calc_date(due_raw)?;
        let actual_return = match actual_return.map(str::trim) {
            None | Some("") => None,
            Some(s) => Some(parse_calc_date(s)?),
        };
        Ok(Self { due, actual_return })
    }

    pub fn evaluate(&self, today: NaiveDate, fee_per_day: i64) -> BorrowingEvaluation {
        evaluate_borrowing(self.due, self.actual_return, today, fee_per_day)
    }
}

pub fn round_off_2_decimals(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comp(id: &str, max_mark: f64, weight: f64) -> ExamComponent {
        ExamComponent {
            id: id.to_string(),
            max_mark,
            weight,
        }
    }

    fn mark(id: &str, marks_obtained: f64) -> ComponentMark {
        ComponentMark {
            component_id: id.to_string(),
            marks_obtained,
        }
    }

    fn d(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("date")
    }

    #[test]
    fn full_marks_on_full_weight_is_an_a() {
        let components = vec![comp("mid", 40.0, 30.0), comp("end", 80.0, 50.0), comp("lab", 25.0, 20.0)];
        let marks = vec![mark("mid", 40.0), mark("end", 80.0), mark("lab", 25.0)];
        let r = compute_grade(&components, &marks, &GradeThresholds::default()).expect("grade");
        assert!((r.normalized_total - 100.0).abs() < 1e-9);
        assert!(r.is_complete());
        assert_eq!(r.grade, Some(Grade::A));
    }

    #[test]
    fn partial_weight_is_never_graded() {
        let components = vec![comp("mid", 50.0, 30.0), comp("end", 50.0, 40.0)];
        let marks = vec![mark("mid", 50.0), mark("end", 50.0)];
        let r = compute_grade(&components, &marks, &GradeThresholds::default()).expect("grade");
        assert_eq!(r.grade, None);
        assert!((r.total_weight - 70.0).abs() < 1e-9);
        assert!((r.normalized_total - 70.0).abs() < 1e-9);
    }

    #[test]
    fn unrecorded_components_do_not_count_toward_weight() {
        let components = vec![comp("a", 50.0, 50.0), comp("b", 50.0, 50.0)];
        let marks = vec![mark("a", 50.0)];
        let r = compute_grade(&components, &marks, &GradeThresholds::default()).expect("grade");
        assert!((r.total_weight - 50.0).abs() < 1e-9);
        assert_eq!(r.grade, None);
    }

    #[test]
    fn two_halves_sum_contributions() {
        let components = vec![comp("a", 50.0, 50.0), comp("b", 50.0, 50.0)];
        let marks = vec![mark("a", 40.0), mark("b", 45.0)];
        let r = compute_grade(&components, &marks, &GradeThresholds::default()).expect("grade");
        assert!((r.normalized_total - 85.0).abs() < 1e-9);
        assert!((r.total_weight - 100.0).abs() < 1e-9);
        assert_eq!(r.grade, Some(Grade::A));

        let marks = vec![mark("a", 40.0), mark("b", 44.5)];
        let r = compute_grade(&components, &marks, &GradeThresholds::default()).expect("grade");
        assert!((r.normalized_total - 84.5).abs() < 1e-9);
        assert_eq!(r.grade, Some(Grade::B));
    }

    #[test]
    fn threshold_boundaries() {
        let t = GradeThresholds::default();
        assert_eq!(t.grade_for(85.0), Grade::A);
        assert_eq!(t.grade_for(84.99), Grade::B);
        assert_eq!(t.grade_for(70.0), Grade::B);
        assert_eq!(t.grade_for(50.0), Grade::C);
        assert_eq!(t.grade_for(49.99), Grade::F);
    }

    #[test]
    fn zero_max_mark_is_rejected_without_a_result() {
        let components = vec![comp("a", 0.0, 50.0), comp("b", 50.0, 50.0)];
        let marks = vec![mark("b", 45.0)];
        let err = compute_grade(&components, &marks, &GradeThresholds::default()).unwrap_err();
        assert!(matches!(err, CalcError::InvalidComponent { ref component_id, .. } if component_id == "a"));
        assert_eq!(err.code(), "invalid_component");
    }

    #[test]
    fn duplicate_marks_for_one_component_are_rejected() {
        let components = vec![comp("a", 50.0, 100.0)];
        let marks = vec![mark("a", 20.0), mark("a", 30.0)];
        let err = compute_grade(&components, &marks, &GradeThresholds::default()).unwrap_err();
        assert_eq!(
            err,
            CalcError::DuplicateComponentMark {
                component_id: "a".to_string()
            }
        );
    }

    #[test]
    fn custom_thresholds_apply() {
        let t = GradeThresholds {
            a: 90.0,
            b: 80.0,
            c: 40.0,
        };
        let components = vec![comp("a", 100.0, 100.0)];
        let r = compute_grade(&components, &[mark("a", 85.0)], &t).expect("grade");
        assert_eq!(r.grade, Some(Grade::B));
        assert!(t.validate().is_ok());
        let bad = GradeThresholds {
            a: 50.0,
            b: 70.0,
            c: 40.0,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn returned_on_due_date_owes_nothing() {
        let e = evaluate_borrowing(d("2025-03-10"), Some(d("2025-03-10")), d("2025-04-01"), 5);
        assert_eq!(e.days_late, 0);
        assert_eq!(e.fee, 0);
        assert_eq!(e.status, BorrowingStatus::Returned);
    }

    #[test]
    fn three_days_overdue_costs_fifteen() {
        let e = evaluate_borrowing(d("2025-03-10"), None, d("2025-03-13"), DEFAULT_LATE_FEE_PER_DAY);
        assert_eq!(e.days_late, 3);
        assert_eq!(e.fee, 15);
        assert_eq!(e.status, BorrowingStatus::Overdue);
    }

    #[test]
    fn borrowed_until_the_day_after_due() {
        let e = evaluate_borrowing(d("2025-03-10"), None, d("2025-03-10"), 5);
        assert_eq!(e.status, BorrowingStatus::Borrowed);
        assert_eq!(e.fee, 0);
        let e = evaluate_borrowing(d("2025-03-10"), None, d("2025-03-01"), 5);
        assert_eq!(e.status, BorrowingStatus::Borrowed);
        assert_eq!(e.days_late, 0);
    }

    #[test]
    fn late_return_keeps_fee_after_return() {
        let e = evaluate_borrowing(d("2025-03-10"), Some(d("2025-03-14")), d("2025-06-01"), 5);
        assert_eq!(e.days_late, 4);
        assert_eq!(e.fee, 20);
        assert_eq!(e.status, BorrowingStatus::Returned);
    }

    #[test]
    fn evaluation_is_idempotent() {
        let dates = BorrowingDates::parse(Some("2025-01-01"), None).expect("dates");
        let a = dates.evaluate(d("2025-01-09"), 5);
        let b = dates.evaluate(d("2025-01-09"), 5);
        assert_eq!(a, b);
    }

    #[test]
    fn time_of_day_is_stripped() {
        assert_eq!(parse_calc_date("2025-03-10T23:59:59").expect("dt"), d("2025-03-10"));
        assert_eq!(parse_calc_date("2025-03-10 08:15:00.250").expect("dt"), d("2025-03-10"));
        assert_eq!(parse_calc_date("2025-03-10T06:00:00+05:30").expect("dt"), d("2025-03-10"));
        let dates = BorrowingDates::parse(Some("2025-03-10T18:00:00"), Some("2025-03-11T01:00:00"))
            .expect("dates");
        assert_eq!(dates.evaluate(d("2025-03-20"), 5).days_late, 1);
    }

    #[test]
    fn bad_dates_fail_instead_of_zero() {
        assert!(matches!(
            BorrowingDates::parse(None, None),
            Err(CalcError::InvalidDate(_))
        ));
        assert!(matches!(
            BorrowingDates::parse(Some("soon"), None),
            Err(CalcError::InvalidDate(_))
        ));
        assert!(matches!(
            BorrowingDates::parse(Some("2025-02-30"), None),
            Err(CalcError::InvalidDate(_))
        ));
        assert!(matches!(
            BorrowingDates::parse(Some("2025-02-01"), Some("later")),
            Err(CalcError::InvalidDate(_))
        ));
        let blank = BorrowingDates::parse(Some("2025-02-01"), Some("  ")).expect("blank return");
        assert_eq!(blank.actual_return, None);
    }

    #[test]
    fn weight_ceiling_helpers() {
        assert!(!exceeds_full_weight(70.0, 30.0));
        assert!(exceeds_full_weight(70.0, 30.5));
        assert!(is_full_weight(33.3 + 33.3 + 33.4));
    }
}
