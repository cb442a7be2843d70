use crate::ipc::helpers::{opt_f64, opt_i64, opt_str, req_str, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use uuid::Uuid;

fn subject_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "subjectCode": r.get::<_, Option<String>>(1)?,
        "subjectName": r.get::<_, String>(2)?,
        "department": r.get::<_, String>(3)?,
        "year": r.get::<_, Option<i64>>(4)?,
        "semester": r.get::<_, Option<i64>>(5)?,
        "credits": r.get::<_, Option<f64>>(6)?,
        "maxMark": r.get::<_, Option<f64>>(7)?,
        "passMark": r.get::<_, Option<f64>>(8)?,
    }))
}

struct SubjectFields {
    subject_code: Option<String>,
    subject_name: String,
    department: String,
    year: Option<i64>,
    semester: Option<i64>,
    credits: Option<f64>,
    max_mark: Option<f64>,
    pass_mark: Option<f64>,
}

fn parse_subject_fields(params: &Value) -> Result<SubjectFields, HandlerErr> {
    let f = SubjectFields {
        subject_code: opt_str(params, "subjectCode")?,
        subject_name: req_str(params, "subjectName")?,
        department: req_str(params, "department")?,
        year: opt_i64(params, "year")?,
        semester: opt_i64(params, "semester")?,
        credits: opt_f64(params, "credits")?,
        max_mark: opt_f64(params, "maxMark")?,
        pass_mark: opt_f64(params, "passMark")?,
    };
    if f.credits.is_some_and(|c| c < 0.0) {
        return Err(HandlerErr::bad_params("credits must be >= 0"));
    }
    if let (Some(max), Some(pass)) = (f.max_mark, f.pass_mark) {
        if max <= 0.0 || pass < 0.0 || pass > max {
            return Err(HandlerErr::bad_params(
                "passMark must be between 0 and maxMark",
            ));
        }
    }
    Ok(f)
}

/// Students only ever see subjects of their own department.
fn subjects_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let department = match opt_str(params, "studentId")? {
        Some(student_id) => {
            let dept: Option<String> = conn
                .query_row(
                    "SELECT department FROM students WHERE id = ?",
                    [&student_id],
                    |r| r.get(0),
                )
                .optional()
                .map_err(|e| HandlerErr::db("db_query_failed", e))?;
            Some(dept.ok_or_else(|| HandlerErr::not_found("student"))?)
        }
        None => opt_str(params, "department")?,
    };
    let semester = opt_i64(params, "semester")?;

    let mut stmt = conn
        .prepare(
            "SELECT id, subject_code, subject_name, department, year, semester, credits, max_mark, pass_mark
             FROM subjects
             WHERE (?1 IS NULL OR department = ?1)
               AND (?2 IS NULL OR semester = ?2)
             ORDER BY subject_name COLLATE NOCASE, id",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let subjects = stmt
        .query_map((department.as_deref(), semester), subject_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "subjects": subjects }))
}

fn subjects_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let f = parse_subject_fields(params)?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO subjects(id, subject_code, subject_name, department, year, semester, credits, max_mark, pass_mark)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            f.subject_code,
            f.subject_name,
            f.department,
            f.year,
            f.semester,
            f.credits,
            f.max_mark,
            f.pass_mark
        ],
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "subjects" })))?;
    Ok(json!({ "subjectId": id }))
}

fn subjects_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = req_str(params, "id")?;
    let f = parse_subject_fields(params)?;
    let changed = conn
        .execute(
            "UPDATE subjects SET subject_code = ?, subject_name = ?, department = ?, year = ?,
                 semester = ?, credits = ?, max_mark = ?, pass_mark = ?
             WHERE id = ?",
            rusqlite::params![
                f.subject_code,
                f.subject_name,
                f.department,
                f.year,
                f.semester,
                f.credits,
                f.max_mark,
                f.pass_mark,
                id
            ],
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("subject"));
    }
    Ok(json!({ "ok": true }))
}

fn subjects_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = req_str(params, "id")?;
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let marks_removed = tx
        .execute("DELETE FROM term_exam_marks WHERE subject_id = ?", [&id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "term_exam_marks" })))?;
    let removed = tx
        .execute("DELETE FROM subjects WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "subjects" })))?;
    if removed == 0 {
        return Err(HandlerErr::not_found("subject"));
    }
    tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    Ok(json!({ "ok": true, "marksRemoved": marks_removed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "subjects.list" => Some(with_conn(state, req, subjects_list)),
        "subjects.create" => Some(with_conn(state, req, subjects_create)),
        "subjects.update" => Some(with_conn(state, req, subjects_update)),
        "subjects.delete" => Some(with_conn(state, req, subjects_delete)),
        _ => None,
    }
}
