use crate::calc::exceeds_full_weight;
use crate::import::{display_number, WEIGHT_EXCEEDED_MESSAGE};
use crate::ipc::helpers::{
    effective_config, id_list, iso, opt_date, opt_i64, opt_str, req_f64, req_str, with_conn,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::reports::student_marks_report;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

struct MarkDraft {
    student_id: String,
    subject_id: String,
    exam_id: String,
    marks_obtained: f64,
    exam_date: Option<String>,
    semester: Option<i64>,
    year: Option<i64>,
}

fn parse_mark_draft(params: &Value) -> Result<MarkDraft, HandlerErr> {
    Ok(MarkDraft {
        student_id: req_str(params, "studentId")?,
        subject_id: req_str(params, "subjectId")?,
        exam_id: req_str(params, "examId")?,
        marks_obtained: req_f64(params, "marksObtained")?,
        exam_date: opt_date(params, "examDate")?.map(iso),
        semester: opt_i64(params, "semester")?,
        year: opt_i64(params, "year")?,
    })
}

fn lookup<T: rusqlite::types::FromSql>(
    conn: &Connection,
    sql: &str,
    id: &str,
    what: &str,
) -> Result<T, HandlerErr> {
    conn.query_row(sql, [id], |r| r.get(0))
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .ok_or_else(|| HandlerErr::not_found(what))
}

/// Checks a draft against the stored rows. `editing` names the mark being
/// replaced so it does not collide with itself.
fn validate_draft(conn: &Connection, d: &MarkDraft, editing: Option<&str>) -> Result<(), HandlerErr> {
    let student_dept: String = lookup(
        conn,
        "SELECT department FROM students WHERE id = ?",
        &d.student_id,
        "student",
    )?;
    let subject_dept: String = lookup(
        conn,
        "SELECT department FROM subjects WHERE id = ?",
        &d.subject_id,
        "subject",
    )?;
    let (max_mark, weight): (f64, f64) = conn
        .query_row(
            "SELECT max_mark, weight FROM term_exams WHERE id = ?",
            [&d.exam_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .ok_or_else(|| HandlerErr::not_found("exam"))?;

    if student_dept != subject_dept {
        return Err(HandlerErr::bad_params("subject does not belong to the student's department")
            .with_details(json!({ "studentDepartment": student_dept, "subjectDepartment": subject_dept })));
    }
    if d.marks_obtained < 0.0 {
        return Err(HandlerErr::bad_params("marksObtained must be >= 0"));
    }
    if d.marks_obtained > max_mark {
        return Err(HandlerErr::bad_params(format!(
            "Marks cannot exceed max mark ({})",
            display_number(max_mark)
        )));
    }

    let duplicate: Option<String> = conn
        .query_row(
            "SELECT id FROM term_exam_marks
             WHERE student_id = ?1 AND subject_id = ?2 AND exam_id = ?3
               AND (?4 IS NULL OR id <> ?4)",
            (&d.student_id, &d.subject_id, &d.exam_id, editing),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if let Some(existing) = duplicate {
        return Err(HandlerErr::new(
            "conflict",
            "Mark already recorded for this student, subject and exam",
        )
        .with_details(json!({ "markId": existing })));
    }

    let recorded: f64 = conn
        .query_row(
            "SELECT COALESCE(SUM(e.weight), 0)
             FROM term_exam_marks m
             JOIN term_exams e ON e.id = m.exam_id
             WHERE m.student_id = ?1 AND m.subject_id = ?2
               AND (?3 IS NULL OR m.id <> ?3)",
            (&d.student_id, &d.subject_id, editing),
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if exceeds_full_weight(recorded, weight) {
        return Err(HandlerErr::new("weight_exceeded", WEIGHT_EXCEEDED_MESSAGE)
            .with_details(json!({ "recordedWeight": recorded, "weight": weight })));
    }
    Ok(())
}

fn marks_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = opt_str(params, "studentId")?;
    let subject_id = opt_str(params, "subjectId")?;
    let search = opt_str(params, "search")?;

    let mut stmt = conn
        .prepare(
            "SELECT m.id, m.student_id, st.student_no, st.name, m.subject_id, su.subject_name,
                    m.exam_id, e.exam_name, e.max_mark, e.weight,
                    m.marks_obtained, m.exam_date, m.semester, m.year
             FROM term_exam_marks m
             JOIN students st ON st.id = m.student_id
             JOIN subjects su ON su.id = m.subject_id
             JOIN term_exams e ON e.id = m.exam_id
             WHERE (?1 IS NULL OR m.student_id = ?1)
               AND (?2 IS NULL OR m.subject_id = ?2)
               AND (?3 IS NULL
                    OR st.student_no LIKE '%' || ?3 || '%'
                    OR st.name LIKE '%' || ?3 || '%'
                    OR su.subject_name LIKE '%' || ?3 || '%')
             ORDER BY st.name COLLATE NOCASE, su.subject_name COLLATE NOCASE, e.exam_name COLLATE NOCASE",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let marks = stmt
        .query_map(
            (student_id.as_deref(), subject_id.as_deref(), search.as_deref()),
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "studentId": r.get::<_, String>(1)?,
                    "studentNo": r.get::<_, String>(2)?,
                    "studentName": r.get::<_, String>(3)?,
                    "subjectId": r.get::<_, String>(4)?,
                    "subjectName": r.get::<_, String>(5)?,
                    "examId": r.get::<_, String>(6)?,
                    "examName": r.get::<_, String>(7)?,
                    "maxMark": r.get::<_, f64>(8)?,
                    "weight": r.get::<_, f64>(9)?,
                    "marksObtained": r.get::<_, f64>(10)?,
                    "examDate": r.get::<_, Option<String>>(11)?,
                    "semester": r.get::<_, Option<i64>>(12)?,
                    "year": r.get::<_, Option<i64>>(13)?,
                }))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "marks": marks }))
}

fn marks_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let d = parse_mark_draft(params)?;
    validate_draft(conn, &d, None)?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO term_exam_marks(id, student_id, subject_id, exam_id, marks_obtained, exam_date, semester, year)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            d.student_id,
            d.subject_id,
            d.exam_id,
            d.marks_obtained,
            d.exam_date,
            d.semester,
            d.year
        ],
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "term_exam_marks" })))?;
    Ok(json!({ "markId": id }))
}

fn marks_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = req_str(params, "id")?;
    let _: String = lookup(conn, "SELECT id FROM term_exam_marks WHERE id = ?", &id, "mark")?;
    let d = parse_mark_draft(params)?;
    validate_draft(conn, &d, Some(&id))?;
    conn.execute(
        "UPDATE term_exam_marks SET student_id = ?, subject_id = ?, exam_id = ?, marks_obtained = ?,
             exam_date = ?, semester = ?, year = ?
         WHERE id = ?",
        rusqlite::params![
            d.student_id,
            d.subject_id,
            d.exam_id,
            d.marks_obtained,
            d.exam_date,
            d.semester,
            d.year,
            id
        ],
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    Ok(json!({ "ok": true }))
}

fn marks_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = req_str(params, "id")?;
    let removed = conn
        .execute("DELETE FROM term_exam_marks WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    if removed == 0 {
        return Err(HandlerErr::not_found("mark"));
    }
    Ok(json!({ "ok": true }))
}

fn marks_delete_many(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let ids = id_list(params, "ids")?;
    if ids.is_empty() {
        return Err(HandlerErr::bad_params("ids must not be empty"));
    }
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let mut deleted = 0usize;
    for id in &ids {
        deleted += tx
            .execute("DELETE FROM term_exam_marks WHERE id = ?", [id])
            .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    }
    tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    Ok(json!({ "deleted": deleted }))
}

fn marks_report(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = req_str(params, "studentId")?;
    let cfg = effective_config(conn)?;
    let report = student_marks_report(conn, &student_id, &cfg)?;
    serde_json::to_value(report).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "marks.list" => Some(with_conn(state, req, marks_list)),
        "marks.create" => Some(with_conn(state, req, marks_create)),
        "marks.update" => Some(with_conn(state, req, marks_update)),
        "marks.delete" => Some(with_conn(state, req, marks_delete)),
        "marks.deleteMany" => Some(with_conn(state, req, marks_delete_many)),
        "marks.report" => Some(with_conn(state, req, marks_report)),
        _ => None,
    }
}
