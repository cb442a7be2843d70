use crate::calc::{
    compute_grade, round_off_2_decimals, BorrowingDates, BorrowingEvaluation, BorrowingStatus,
    CalcConfig, CalcError, ComponentMark, ExamComponent, Grade,
};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error(transparent)]
    Calc(#[from] CalcError),
    #[error("database query failed: {0}")]
    Db(#[from] rusqlite::Error),
}

impl ReportError {
    pub fn code(&self) -> &'static str {
        match self {
            ReportError::NotFound(_) => "not_found",
            ReportError::Calc(e) => e.code(),
            ReportError::Db(_) => "db_query_failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentLine {
    pub mark_id: String,
    pub exam_id: String,
    pub exam_name: String,
    pub max_mark: f64,
    pub weight: f64,
    pub marks_obtained: f64,
    pub exam_date: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectGrade {
    pub subject_id: String,
    pub subject_code: Option<String>,
    pub subject_name: String,
    pub semester: Option<i64>,
    pub components: Vec<ComponentLine>,
    pub normalized_total: f64,
    pub total_weight: f64,
    pub grade: Option<Grade>,
    pub complete: bool,
    pub result: &'static str,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentMarksReport {
    pub student_id: String,
    pub student_no: String,
    pub name: String,
    pub subjects: Vec<SubjectGrade>,
    pub graded_count: usize,
    pub incomplete_count: usize,
}

fn result_label(grade: Option<Grade>) -> &'static str {
    match grade {
        Some(g) if g.is_pass() => "Pass",
        Some(_) => "Fail",
        None => "Incomplete",
    }
}

struct SubjectRows {
    subject_id: String,
    subject_code: Option<String>,
    subject_name: String,
    semester: Option<i64>,
    lines: Vec<ComponentLine>,
}

pub fn student_marks_report(
    conn: &Connection,
    student_id: &str,
    cfg: &CalcConfig,
) -> Result<StudentMarksReport, ReportError> {
    let student: Option<(String, String)> = conn
        .query_row(
            "SELECT student_no, name FROM students WHERE id = ?",
            [student_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((student_no, name)) = student else {
        return Err(ReportError::NotFound("student"));
    };

    let mut stmt = conn.prepare(
        "SELECT m.id, m.subject_id, s.subject_code, s.subject_name, m.semester,
                m.exam_id, e.exam_name, e.max_mark, e.weight, m.marks_obtained, m.exam_date
         FROM term_exam_marks m
         JOIN subjects s ON s.id = m.subject_id
         JOIN term_exams e ON e.id = m.exam_id
         WHERE m.student_id = ?
         ORDER BY s.subject_name COLLATE NOCASE, s.id, e.exam_name COLLATE NOCASE",
    )?;
    let rows = stmt.query_map([student_id], |r| {
        Ok((
            r.get::<_, String>(1)?,
            r.get::<_, Option<String>>(2)?,
            r.get::<_, String>(3)?,
            r.get::<_, Option<i64>>(4)?,
            ComponentLine {
                mark_id: r.get(0)?,
                exam_id: r.get(5)?,
                exam_name: r.get(6)?,
                max_mark: r.get(7)?,
                weight: r.get(8)?,
                marks_obtained: r.get(9)?,
                exam_date: r.get(10)?,
            },
        ))
    })?;

    let mut groups: Vec<SubjectRows> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for row in rows {
        let (subject_id, subject_code, subject_name, semester, line) = row?;
        let slot = match index.get(&subject_id) {
            Some(i) => *i,
            None => {
                index.insert(subject_id.clone(), groups.len());
                groups.push(SubjectRows {
                    subject_id,
                    subject_code,
                    subject_name,
                    semester,
                    lines: Vec::new(),
                });
                groups.len() - 1
            }
        };
        groups[slot].lines.push(line);
    }

    let mut subjects = Vec::with_capacity(groups.len());
    for g in groups {
        let components: Vec<ExamComponent> = g
            .lines
            .iter()
            .map(|l| ExamComponent {
                id: l.exam_id.clone(),
                max_mark: l.max_mark,
                weight: l.weight,
            })
            .collect();
        let marks: Vec<ComponentMark> = g
            .lines
            .iter()
            .map(|l| ComponentMark {
                component_id: l.exam_id.clone(),
                marks_obtained: l.marks_obtained,
            })
            .collect();
        let graded = compute_grade(&components, &marks, &cfg.grade_thresholds)?;
        subjects.push(SubjectGrade {
            subject_id: g.subject_id,
            subject_code: g.subject_code,
            subject_name: g.subject_name,
            semester: g.semester,
            components: g.lines,
            normalized_total: round_off_2_decimals(graded.normalized_total),
            total_weight: round_off_2_decimals(graded.total_weight),
            grade: graded.grade,
            complete: graded.is_complete(),
            result: result_label(graded.grade),
        });
    }

    let graded_count = subjects.iter().filter(|s| s.grade.is_some()).count();
    let incomplete_count = subjects.len() - graded_count;
    Ok(StudentMarksReport {
        student_id: student_id.to_string(),
        student_no,
        name,
        subjects,
        graded_count,
        incomplete_count,
    })
}

#[derive(Debug, Clone, Default)]
pub struct BorrowingFilter {
    pub student_id: Option<String>,
    pub borrowing_id: Option<String>,
    pub status: Option<BorrowingStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BorrowingRow {
    pub id: String,
    pub book_id: String,
    pub book_title: String,
    pub book_author: String,
    pub student_id: String,
    pub student_no: String,
    pub student_name: String,
    pub issue_date: String,
    pub return_date: String,
    pub actual_return_date: Option<String>,
    pub days_late: i64,
    pub fee: i64,
    pub status: BorrowingStatus,
}

pub fn borrowing_rows(
    conn: &Connection,
    filter: &BorrowingFilter,
    today: NaiveDate,
    cfg: &CalcConfig,
) -> Result<Vec<BorrowingRow>, ReportError> {
    let mut stmt = conn.prepare(
        "SELECT bb.id, bb.book_id, b.title, b.author, bb.student_id, s.student_no, s.name,
                bb.issue_date, bb.return_date, bb.actual_return_date
         FROM book_borrowings bb
         JOIN books b ON b.id = bb.book_id
         JOIN students s ON s.id = bb.student_id
         WHERE (?1 IS NULL OR bb.student_id = ?1)
           AND (?2 IS NULL OR bb.id = ?2)
         ORDER BY bb.issue_date DESC, bb.id",
    )?;
    let raw = stmt
        .query_map(
            (filter.student_id.as_deref(), filter.borrowing_id.as_deref()),
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                    r.get::<_, String>(5)?,
                    r.get::<_, String>(6)?,
                    r.get::<_, String>(7)?,
                    r.get::<_, String>(8)?,
                    r.get::<_, Option<String>>(9)?,
                ))
            },
        )?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = Vec::with_capacity(raw.len());
    for (
        id,
        book_id,
        book_title,
        book_author,
        student_id,
        student_no,
        student_name,
        issue_date,
        return_date,
        actual_return_date,
    ) in raw
    {
        let dates = BorrowingDates::parse(Some(&return_date), actual_return_date.as_deref())?;
        let BorrowingEvaluation {
            days_late,
            fee,
            status,
        } = dates.evaluate(today, cfg.late_fee_per_day);
        if filter.status.is_some_and(|want| want != status) {
            continue;
        }
        out.push(BorrowingRow {
            id,
            book_id,
            book_title,
            book_author,
            student_id,
            student_no,
            student_name,
            issue_date,
            return_date,
            actual_return_date,
            days_late,
            fee,
            status,
        });
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LibraryReport {
    pub student_id: String,
    pub today: String,
    pub borrowings: Vec<BorrowingRow>,
    pub total_fee: i64,
    pub overdue_count: usize,
    pub active_count: usize,
}

pub fn library_report(
    conn: &Connection,
    student_id: &str,
    today: NaiveDate,
    cfg: &CalcConfig,
) -> Result<LibraryReport, ReportError> {
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
            r.get(0)
        })
        .optional()?;
    if exists.is_none() {
        return Err(ReportError::NotFound("student"));
    }

    let filter = BorrowingFilter {
        student_id: Some(student_id.to_string()),
        ..BorrowingFilter::default()
    };
    let borrowings = borrowing_rows(conn, &filter, today, cfg)?;
    let total_fee = borrowings.iter().map(|b| b.fee).sum();
    let overdue_count = borrowings
        .iter()
        .filter(|b| b.status == BorrowingStatus::Overdue)
        .count();
    let active_count = borrowings
        .iter()
        .filter(|b| b.status != BorrowingStatus::Returned)
        .count();
    Ok(LibraryReport {
        student_id: student_id.to_string(),
        today: today.format("%Y-%m-%d").to_string(),
        borrowings,
        total_fee,
        overdue_count,
        active_count,
    })
}
