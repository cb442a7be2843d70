use crate::calc::exceeds_full_weight;
use crate::import::{display_number, same_exam, EXAM_DUPLICATE_MESSAGE, WEIGHT_EXCEEDED_MESSAGE};
use crate::ipc::helpers::{id_list, opt_str, req_f64, req_str, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

struct ExamFields {
    exam_name: String,
    max_mark: f64,
    weight: f64,
}

fn parse_exam_fields(params: &Value) -> Result<ExamFields, HandlerErr> {
    let exam_name = req_str(params, "examName")?;
    let max_mark = req_f64(params, "maxMark")?;
    let weight = req_f64(params, "weight")?;
    if max_mark <= 0.0 {
        return Err(HandlerErr::bad_params("maxMark must be > 0"));
    }
    if !(0.0..=100.0).contains(&weight) {
        return Err(HandlerErr::bad_params("weight must be between 0 and 100"));
    }
    Ok(ExamFields {
        exam_name,
        max_mark,
        weight,
    })
}

fn exam_label(name: &str, max_mark: f64, weight: f64) -> String {
    format!(
        "{}({},{})",
        name,
        display_number(max_mark),
        display_number(weight)
    )
}

fn find_duplicate(conn: &Connection, f: &ExamFields, except_id: Option<&str>) -> Result<Option<String>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, exam_name, max_mark, weight FROM term_exams WHERE (?1 IS NULL OR id <> ?1)")
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let rows = stmt
        .query_map([except_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, f64>(2)?,
                r.get::<_, f64>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(rows
        .into_iter()
        .find(|(_, name, max, weight)| same_exam(name, *max, *weight, &f.exam_name, f.max_mark, f.weight))
        .map(|(id, ..)| id))
}

fn duplicate_err(existing_id: String) -> HandlerErr {
    HandlerErr::new("conflict", EXAM_DUPLICATE_MESSAGE).with_details(json!({ "examId": existing_id }))
}

fn exams_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let search = opt_str(params, "search")?;
    let sort_col = match opt_str(params, "sortBy")?.as_deref() {
        None | Some("examName") => "exam_name COLLATE NOCASE",
        Some("maxMark") => "max_mark",
        Some(other) => {
            return Err(HandlerErr::bad_params(format!(
                "sortBy must be examName or maxMark, got {}",
                other
            )))
        }
    };
    let sort_dir = match opt_str(params, "sortOrder")?.as_deref() {
        None | Some("asc") => "ASC",
        Some("desc") => "DESC",
        Some(_) => return Err(HandlerErr::bad_params("sortOrder must be asc or desc")),
    };

    let sql = format!(
        "SELECT id, exam_name, max_mark, weight FROM term_exams
         WHERE (?1 IS NULL OR exam_name LIKE '%' || ?1 || '%')
         ORDER BY {} {}, id",
        sort_col, sort_dir
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let exams = stmt
        .query_map([search.as_deref()], |r| {
            let name: String = r.get(1)?;
            let max_mark: f64 = r.get(2)?;
            let weight: f64 = r.get(3)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "label": exam_label(&name, max_mark, weight),
                "examName": name,
                "maxMark": max_mark,
                "weight": weight,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "exams": exams }))
}

fn exams_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let f = parse_exam_fields(params)?;
    if let Some(existing) = find_duplicate(conn, &f, None)? {
        return Err(duplicate_err(existing));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO term_exams(id, exam_name, max_mark, weight) VALUES(?, ?, ?, ?)",
        (&id, &f.exam_name, f.max_mark, f.weight),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "term_exams" })))?;
    Ok(json!({ "examId": id }))
}

/// Heaviest total weight any (student, subject) using `exam_id` carries from
/// its other recorded exams.
fn heaviest_other_weight(conn: &Connection, exam_id: &str) -> Result<f64, HandlerErr> {
    let w: Option<f64> = conn
        .query_row(
            "SELECT MAX(other) FROM (
                 SELECT SUM(CASE WHEN e.id = ?1 THEN 0 ELSE e.weight END) AS other
                 FROM term_exam_marks m
                 JOIN term_exams e ON e.id = m.exam_id
                 WHERE EXISTS (
                     SELECT 1 FROM term_exam_marks x
                     WHERE x.exam_id = ?1
                       AND x.student_id = m.student_id
                       AND x.subject_id = m.subject_id
                 )
                 GROUP BY m.student_id, m.subject_id
             )",
            [exam_id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(w.unwrap_or(0.0))
}

fn exams_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = req_str(params, "id")?;
    let f = parse_exam_fields(params)?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM term_exams WHERE id = ?", [&id], |r| r.get(0))
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("exam"));
    }
    if let Some(existing) = find_duplicate(conn, &f, Some(&id))? {
        return Err(duplicate_err(existing));
    }

    let highest_mark: Option<f64> = conn
        .query_row(
            "SELECT MAX(marks_obtained) FROM term_exam_marks WHERE exam_id = ?",
            [&id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if let Some(highest) = highest_mark.filter(|m| *m > f.max_mark) {
        return Err(HandlerErr::bad_params(format!(
            "maxMark cannot be lower than an existing mark ({})",
            display_number(highest)
        ))
        .with_details(json!({ "highestMark": highest })));
    }

    let other = heaviest_other_weight(conn, &id)?;
    if exceeds_full_weight(other, f.weight) {
        return Err(HandlerErr::new("weight_exceeded", WEIGHT_EXCEEDED_MESSAGE)
            .with_details(json!({ "recordedWeight": other, "weight": f.weight })));
    }

    conn.execute(
        "UPDATE term_exams SET exam_name = ?, max_mark = ?, weight = ? WHERE id = ?",
        (&f.exam_name, f.max_mark, f.weight, &id),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    Ok(json!({ "ok": true }))
}

fn delete_exams(conn: &Connection, ids: &[String]) -> Result<Value, HandlerErr> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let mut deleted = 0usize;
    let mut marks_removed = 0usize;
    for id in ids {
        marks_removed += tx
            .execute("DELETE FROM term_exam_marks WHERE exam_id = ?", [id])
            .map_err(|e| HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "term_exam_marks" })))?;
        deleted += tx
            .execute("DELETE FROM term_exams WHERE id = ?", [id])
            .map_err(|e| HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "term_exams" })))?;
    }
    tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    Ok(json!({ "deleted": deleted, "marksRemoved": marks_removed }))
}

fn exams_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = req_str(params, "id")?;
    let result = delete_exams(conn, std::slice::from_ref(&id))?;
    if result["deleted"].as_u64() == Some(0) {
        return Err(HandlerErr::not_found("exam"));
    }
    Ok(result)
}

fn exams_delete_many(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let ids = id_list(params, "ids")?;
    if ids.is_empty() {
        return Err(HandlerErr::bad_params("ids must not be empty"));
    }
    delete_exams(conn, &ids)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "exams.list" => Some(with_conn(state, req, exams_list)),
        "exams.create" => Some(with_conn(state, req, exams_create)),
        "exams.update" => Some(with_conn(state, req, exams_update)),
        "exams.delete" => Some(with_conn(state, req, exams_delete)),
        "exams.deleteMany" => Some(with_conn(state, req, exams_delete_many)),
        _ => None,
    }
}
