use crate::import::{
    plan_exam_import, plan_mark_import, read_csv_file, read_csv_records, ExistingExam,
    ImportStudent, ImportSubject, MarkImportContext, RecordedMark, RowOutcome,
};
use crate::ipc::helpers::{opt_str, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImportMode {
    Preview,
    Apply,
}

impl ImportMode {
    fn as_str(self) -> &'static str {
        match self {
            ImportMode::Preview => "preview",
            ImportMode::Apply => "apply",
        }
    }
}

fn parse_mode(params: &Value) -> Result<ImportMode, HandlerErr> {
    match opt_str(params, "mode")?.as_deref() {
        None | Some("preview") => Ok(ImportMode::Preview),
        Some("apply") => Ok(ImportMode::Apply),
        Some(other) => Err(HandlerErr::bad_params(format!(
            "mode must be preview or apply, got {}",
            other
        ))),
    }
}

/// CSV records from inline `csv` text or from a file at `path`.
fn load_records(params: &Value) -> Result<Vec<Vec<String>>, HandlerErr> {
    let text = match (params.get("csv").and_then(|v| v.as_str()), opt_str(params, "path")?) {
        (Some(text), _) => text.to_string(),
        (None, Some(path)) => read_csv_file(&PathBuf::from(path))?,
        (None, None) => return Err(HandlerErr::bad_params("missing params.csv or params.path")),
    };
    Ok(read_csv_records(&text)?)
}

fn query_all<T, F>(conn: &Connection, sql: &str, map: F) -> Result<Vec<T>, HandlerErr>
where
    F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
{
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let rows = stmt
        .query_map([], map)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(rows)
}

fn existing_exams(conn: &Connection) -> Result<Vec<ExistingExam>, HandlerErr> {
    query_all(
        conn,
        "SELECT id, exam_name, max_mark, weight FROM term_exams ORDER BY exam_name, id",
        |r| {
            Ok(ExistingExam {
                id: r.get(0)?,
                exam_name: r.get(1)?,
                max_mark: r.get(2)?,
                weight: r.get(3)?,
            })
        },
    )
}

fn summarize<T: Serialize>(
    kind: &str,
    mode: ImportMode,
    rows: &[RowOutcome<T>],
    inserted: usize,
) -> Value {
    let accepted = rows.iter().filter(|r| r.ok).count();
    let rejected = rows.len() - accepted;
    tracing::info!(
        kind,
        mode = mode.as_str(),
        accepted,
        rejected,
        inserted,
        "import finished"
    );
    json!({
        "mode": mode.as_str(),
        "rows": rows,
        "accepted": accepted,
        "rejected": rejected,
        "inserted": inserted,
    })
}

fn import_exams(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let mode = parse_mode(params)?;
    let records = load_records(params)?;
    let existing = existing_exams(conn)?;
    let rows = plan_exam_import(&records, &existing)?;

    let mut inserted = 0usize;
    if mode == ImportMode::Apply {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
        for exam in rows.iter().filter_map(|r| r.record.as_ref()) {
            tx.execute(
                "INSERT INTO term_exams(id, exam_name, max_mark, weight) VALUES(?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    &exam.exam_name,
                    exam.max_mark,
                    exam.weight,
                ),
            )
            .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "term_exams" })))?;
            inserted += 1;
        }
        tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    }
    Ok(summarize("exams", mode, &rows, inserted))
}

fn import_marks(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let mode = parse_mode(params)?;
    let records = load_records(params)?;

    let students = query_all(
        conn,
        "SELECT id, student_no, name, department FROM students ORDER BY student_no, id",
        |r| {
            Ok(ImportStudent {
                id: r.get(0)?,
                student_no: r.get(1)?,
                name: r.get(2)?,
                department: r.get(3)?,
            })
        },
    )?;
    let subjects = query_all(
        conn,
        "SELECT id, subject_name, subject_code, department FROM subjects ORDER BY subject_name, id",
        |r| {
            Ok(ImportSubject {
                id: r.get(0)?,
                subject_name: r.get(1)?,
                subject_code: r.get(2)?,
                department: r.get(3)?,
            })
        },
    )?;
    let exams = existing_exams(conn)?;
    let recorded = query_all(
        conn,
        "SELECT student_id, subject_id, exam_id FROM term_exam_marks",
        |r| {
            Ok(RecordedMark {
                student_id: r.get(0)?,
                subject_id: r.get(1)?,
                exam_id: r.get(2)?,
            })
        },
    )?;
    let ctx = MarkImportContext {
        students: &students,
        subjects: &subjects,
        exams: &exams,
        recorded: &recorded,
    };
    let rows = plan_mark_import(&records, &ctx)?;

    let mut inserted = 0usize;
    if mode == ImportMode::Apply {
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
        for m in rows.iter().filter_map(|r| r.record.as_ref()) {
            tx.execute(
                "INSERT INTO term_exam_marks(id, student_id, subject_id, exam_id, marks_obtained, exam_date, semester, year)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    Uuid::new_v4().to_string(),
                    m.student_id,
                    m.subject_id,
                    m.exam_id,
                    m.marks_obtained,
                    m.exam_date,
                    m.semester,
                    m.year
                ],
            )
            .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "term_exam_marks" })))?;
            inserted += 1;
        }
        tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    }
    Ok(summarize("marks", mode, &rows, inserted))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "import.exams" => Some(with_conn(state, req, import_exams)),
        "import.marks" => Some(with_conn(state, req, import_marks)),
        _ => None,
    }
}
