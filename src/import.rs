use crate::calc::exceeds_full_weight;
use chrono::{Days, NaiveDate};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

pub const EXAM_DUPLICATE_MESSAGE: &str = "Duplicate exam (name, max mark, and weight) already exists.";
pub const WEIGHT_EXCEEDED_MESSAGE: &str =
    "Adding this mark would exceed 100% total weightage for this subject.";
const BAD_DATE_MESSAGE: &str = "Invalid or missing exam date (use DD-MM-YYYY or DD/MM/YYYY)";

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("csv parse failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("could not read import file: {0}")]
    Io(#[from] std::io::Error),
    #[error("import has no header row")]
    Empty,
}

impl ImportError {
    pub fn code(&self) -> &'static str {
        match self {
            ImportError::Csv(_) => "bad_csv",
            ImportError::Io(_) => "io_failed",
            ImportError::Empty => "bad_params",
        }
    }
}

/// Lookup key for headers and cell values: trimmed, lowercased, with every
/// underscore and whitespace run removed.
pub fn normalize_key(s: &str) -> String {
    s.trim()
        .to_lowercase()
        .chars()
        .filter(|c| *c != '_' && !c.is_whitespace())
        .collect()
}

/// Largest spreadsheet serial that still names a real day (9999-12-31).
const MAX_DATE_SERIAL: f64 = 2_958_465.0;

/// Spreadsheet-friendly date parsing: ISO dates, day-first dates with `-` or
/// `/`, two-digit years, and bare spreadsheet serial numbers.
pub fn parse_import_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(serial) = s.parse::<f64>() {
        if !serial.is_finite() || !(1.0..=MAX_DATE_SERIAL).contains(&serial) {
            return None;
        }
        let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?;
        return epoch.checked_add_days(Days::new(serial.floor() as u64));
    }
    parse_day_first_date(s)
}

/// `YYYY-MM-DD`, `D-M-YYYY`, `D/M/YYYY` or `D-M-YY` (`YY < 50` is 20YY).
pub fn parse_day_first_date(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    let parts: Vec<&str> = s.split(['/', '-']).collect();
    if parts.len() != 3
        || parts
            .iter()
            .any(|p| p.is_empty() || !p.chars().all(|c| c.is_ascii_digit()))
    {
        return None;
    }
    let nums: Vec<u32> = parts
        .iter()
        .map(|p| p.parse::<u32>())
        .collect::<Result<_, _>>()
        .ok()?;

    let (year, month, day) = if parts[0].len() == 4 {
        (nums[0] as i32, nums[1], nums[2])
    } else if parts[2].len() == 4 {
        (nums[2] as i32, nums[1], nums[0])
    } else if parts[2].len() == 2 {
        let yy = nums[2] as i32;
        let year = if yy < 50 { 2000 + yy } else { 1900 + yy };
        (year, nums[1], nums[0])
    } else {
        return None;
    };
    NaiveDate::from_ymd_opt(year, month, day)
}

pub fn read_csv_file(path: &Path) -> Result<String, ImportError> {
    Ok(std::fs::read_to_string(path)?)
}

/// All non-blank records, header included. Rows may have ragged widths.
pub fn read_csv_records(text: &str) -> Result<Vec<Vec<String>>, ImportError> {
    let text = text.trim_start_matches('\u{feff}');
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());
    let mut out = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        let row: Vec<String> = rec.iter().map(|s| s.to_string()).collect();
        if row.iter().all(|c| c.is_empty()) {
            continue;
        }
        out.push(row);
    }
    Ok(out)
}

const EXAM_COLUMNS: [&[&str]; 3] = [
    &["examname", "exam", "name", "examtitle"],
    &["maxmark", "maxmarks", "max", "outof", "maximum"],
    &["weight", "weightage", "weight%", "weightpercent"],
];

const MARK_COLUMNS: [&[&str]; 7] = [
    &["student", "studentid", "studentno", "rollno", "studentname"],
    &["subject", "subjectid", "subjectname", "subjectcode"],
    &["exam", "examid", "examname"],
    &["marksobtained", "marks", "mark", "score"],
    &["examdate", "date"],
    &["semester", "sem"],
    &["year"],
];

/// Falls back to positional columns when the header row names none of them.
fn map_columns(header: &[String], columns: &[&[&str]]) -> Vec<Option<usize>> {
    let normalized: Vec<String> = header.iter().map(|h| normalize_key(h)).collect();
    let mapped: Vec<Option<usize>> = columns
        .iter()
        .map(|aliases| normalized.iter().position(|h| aliases.contains(&h.as_str())))
        .collect();
    if mapped.iter().all(Option::is_none) {
        (0..columns.len()).map(Some).collect()
    } else {
        mapped
    }
}

fn cell(row: &[String], idx: Option<usize>) -> &str {
    idx.and_then(|i| row.get(i))
        .map(|s| s.trim())
        .unwrap_or("")
}

fn parse_finite(s: &str) -> Option<f64> {
    s.parse::<f64>().ok().filter(|n| n.is_finite())
}

pub fn display_number(x: f64) -> String {
    if x.fract() == 0.0 && x.abs() < 1e15 {
        format!("{}", x as i64)
    } else {
        format!("{}", x)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowOutcome<T> {
    pub row: usize,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<T>,
}

impl<T> RowOutcome<T> {
    fn accepted(row: usize, record: T) -> Self {
        Self {
            row,
            ok: true,
            error: None,
            record: Some(record),
        }
    }

    fn rejected(row: usize, message: impl Into<String>) -> Self {
        Self {
            row,
            ok: false,
            error: Some(message.into()),
            record: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExistingExam {
    pub id: String,
    pub exam_name: String,
    pub max_mark: f64,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewExam {
    pub exam_name: String,
    pub max_mark: f64,
    pub weight: f64,
}

/// Exams are considered the same when name (trimmed, case-insensitive),
/// max mark and weight all agree.
pub fn same_exam(name_a: &str, max_a: f64, weight_a: f64, name_b: &str, max_b: f64, weight_b: f64) -> bool {
    name_a.trim().to_lowercase() == name_b.trim().to_lowercase()
        && (max_a - max_b).abs() < 1e-9
        && (weight_a - weight_b).abs() < 1e-9
}

pub fn plan_exam_import(
    records: &[Vec<String>],
    existing: &[ExistingExam],
) -> Result<Vec<RowOutcome<NewExam>>, ImportError> {
    let Some((header, rows)) = records.split_first() else {
        return Err(ImportError::Empty);
    };
    let cols = map_columns(header, &EXAM_COLUMNS);

    let mut accepted: Vec<NewExam> = Vec::new();
    let mut out = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        let row_no = i + 2;
        let name = cell(row, cols[0]);
        let max_raw = cell(row, cols[1]);
        let weight_raw = cell(row, cols[2]);
        if name.is_empty() || max_raw.is_empty() || weight_raw.is_empty() {
            out.push(RowOutcome::rejected(row_no, "All fields required"));
            continue;
        }
        let Some(max_mark) = parse_finite(max_raw).filter(|v| *v > 0.0) else {
            out.push(RowOutcome::rejected(row_no, "Max Mark must be a positive number"));
            continue;
        };
        let Some(weight) = parse_finite(weight_raw).filter(|v| *v >= 0.0) else {
            out.push(RowOutcome::rejected(row_no, "Weight must be a non-negative number"));
            continue;
        };
        if weight > 100.0 {
            out.push(RowOutcome::rejected(row_no, "Weight must not exceed 100"));
            continue;
        }

        let duplicate = existing
            .iter()
            .any(|e| same_exam(&e.exam_name, e.max_mark, e.weight, name, max_mark, weight))
            || accepted
                .iter()
                .any(|e| same_exam(&e.exam_name, e.max_mark, e.weight, name, max_mark, weight));
        if duplicate {
            out.push(RowOutcome::rejected(row_no, EXAM_DUPLICATE_MESSAGE));
            continue;
        }

        let record = NewExam {
            exam_name: name.to_string(),
            max_mark,
            weight,
        };
        accepted.push(record.clone());
        out.push(RowOutcome::accepted(row_no, record));
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct ImportStudent {
    pub id: String,
    pub student_no: String,
    pub name: String,
    pub department: String,
}

#[derive(Debug, Clone)]
pub struct ImportSubject {
    pub id: String,
    pub subject_name: String,
    pub subject_code: Option<String>,
    pub department: String,
}

#[derive(Debug, Clone)]
pub struct RecordedMark {
    pub student_id: String,
    pub subject_id: String,
    pub exam_id: String,
}

pub struct MarkImportContext<'a> {
    pub students: &'a [ImportStudent],
    pub subjects: &'a [ImportSubject],
    pub exams: &'a [ExistingExam],
    pub recorded: &'a [RecordedMark],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMark {
    pub student_id: String,
    pub subject_id: String,
    pub exam_id: String,
    pub marks_obtained: f64,
    pub exam_date: String,
    pub semester: i64,
    pub year: i64,
}

pub fn plan_mark_import(
    records: &[Vec<String>],
    ctx: &MarkImportContext<'_>,
) -> Result<Vec<RowOutcome<NewMark>>, ImportError> {
    let Some((header, rows)) = records.split_first() else {
        return Err(ImportError::Empty);
    };
    let cols = map_columns(header, &MARK_COLUMNS);

    let exam_weight: HashMap<&str, f64> = ctx
        .exams
        .iter()
        .map(|e| (e.id.as_str(), e.weight))
        .collect();
    let mut taken: HashSet<(String, String, String)> = HashSet::new();
    let mut weight_by_pair: HashMap<(String, String), f64> = HashMap::new();
    for m in ctx.recorded {
        taken.insert((m.student_id.clone(), m.subject_id.clone(), m.exam_id.clone()));
        *weight_by_pair
            .entry((m.student_id.clone(), m.subject_id.clone()))
            .or_insert(0.0) += exam_weight.get(m.exam_id.as_str()).copied().unwrap_or(0.0);
    }

    let mut out = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        let row_no = i + 2;

        let student_key = normalize_key(cell(row, cols[0]));
        let student = ctx.students.iter().find(|s| {
            !student_key.is_empty()
                && (normalize_key(&s.student_no) == student_key || normalize_key(&s.name) == student_key)
        });
        let Some(student) = student else {
            out.push(RowOutcome::rejected(row_no, "Student not found"));
            continue;
        };

        let subject_key = normalize_key(cell(row, cols[1]));
        let subject = ctx.subjects.iter().find(|s| {
            !subject_key.is_empty()
                && s.department == student.department
                && (normalize_key(&s.subject_name) == subject_key
                    || normalize_key(&s.id) == subject_key
                    || s.subject_code
                        .as_deref()
                        .map(|c| normalize_key(c) == subject_key)
                        .unwrap_or(false))
        });
        let Some(subject) = subject else {
            out.push(RowOutcome::rejected(row_no, "Subject not found"));
            continue;
        };

        let exam_key = normalize_key(cell(row, cols[2]));
        let exam = ctx.exams.iter().find(|e| {
            !exam_key.is_empty()
                && (normalize_key(&e.exam_name) == exam_key || normalize_key(&e.id) == exam_key)
        });
        let Some(exam) = exam else {
            out.push(RowOutcome::rejected(row_no, "Exam not found"));
            continue;
        };

        let marks_raw = cell(row, cols[3]);
        if marks_raw.is_empty() {
            out.push(RowOutcome::rejected(row_no, "Marks required"));
            continue;
        }
        let Some(marks_obtained) = parse_finite(marks_raw) else {
            out.push(RowOutcome::rejected(row_no, "Marks must be a number"));
            continue;
        };
        if marks_obtained < 0.0 {
            out.push(RowOutcome::rejected(row_no, "Marks must not be negative"));
            continue;
        }

        let Some(exam_date) = parse_import_date(cell(row, cols[4])) else {
            out.push(RowOutcome::rejected(row_no, BAD_DATE_MESSAGE));
            continue;
        };

        if marks_obtained > exam.max_mark {
            out.push(RowOutcome::rejected(
                row_no,
                format!("Marks cannot exceed max mark ({})", display_number(exam.max_mark)),
            ));
            continue;
        }

        let semester = cell(row, cols[5]).parse::<i64>();
        let year = cell(row, cols[6]).parse::<i64>();
        let (Ok(semester), Ok(year)) = (semester, year) else {
            out.push(RowOutcome::rejected(row_no, "Semester and year must be whole numbers"));
            continue;
        };

        let key = (student.id.clone(), subject.id.clone(), exam.id.clone());
        if taken.contains(&key) {
            out.push(RowOutcome::rejected(
                row_no,
                "Mark already recorded for this student, subject and exam",
            ));
            continue;
        }
        let pair = (student.id.clone(), subject.id.clone());
        let recorded_weight = weight_by_pair.get(&pair).copied().unwrap_or(0.0);
        if exceeds_full_weight(recorded_weight, exam.weight) {
            out.push(RowOutcome::rejected(row_no, WEIGHT_EXCEEDED_MESSAGE));
            continue;
        }

        taken.insert(key);
        weight_by_pair.insert(pair, recorded_weight + exam.weight);
        out.push(RowOutcome::accepted(
            row_no,
            NewMark {
                student_id: student.id.clone(),
                subject_id: subject.id.clone(),
                exam_id: exam.id.clone(),
                marks_obtained,
                exam_date: exam_date.format("%Y-%m-%d").to_string(),
                semester,
                year,
            },
        ));
    }
    Ok(out)
}
