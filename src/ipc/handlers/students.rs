use crate::ipc::helpers::{
    iso, opt_i64, opt_str, parse_any_date, req_date, req_str, require_conn, respond, with_conn,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};
use uuid::Uuid;

const STUDENT_COLUMNS: &str =
    "id, student_no, name, email, department, year, semester, date_of_birth, phone, address";

const BAD_LOGIN: &str = "Invalid Student ID or Date of Birth";

fn student_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "studentNo": r.get::<_, String>(1)?,
        "name": r.get::<_, String>(2)?,
        "email": r.get::<_, Option<String>>(3)?,
        "department": r.get::<_, String>(4)?,
        "year": r.get::<_, Option<i64>>(5)?,
        "semester": r.get::<_, Option<i64>>(6)?,
        "dateOfBirth": r.get::<_, String>(7)?,
        "phone": r.get::<_, Option<String>>(8)?,
        "address": r.get::<_, Option<String>>(9)?,
    }))
}

struct StudentFields {
    student_no: String,
    name: String,
    email: Option<String>,
    department: String,
    year: Option<i64>,
    semester: Option<i64>,
    date_of_birth: String,
    phone: Option<String>,
    address: Option<String>,
}

fn parse_student_fields(params: &Value) -> Result<StudentFields, HandlerErr> {
    let year = opt_i64(params, "year")?;
    let semester = opt_i64(params, "semester")?;
    if year.is_some_and(|y| y < 1) || semester.is_some_and(|s| s < 1) {
        return Err(HandlerErr::bad_params("year and semester must be >= 1"));
    }
    Ok(StudentFields {
        student_no: req_str(params, "studentNo")?,
        name: req_str(params, "name")?,
        email: opt_str(params, "email")?,
        department: req_str(params, "department")?,
        year,
        semester,
        date_of_birth: iso(req_date(params, "dateOfBirth")?),
        phone: opt_str(params, "phone")?,
        address: opt_str(params, "address")?,
    })
}

fn student_no_taken(conn: &Connection, student_no: &str, except_id: Option<&str>) -> Result<bool, HandlerErr> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM students WHERE student_no = ?1 AND (?2 IS NULL OR id <> ?2)",
            (student_no, except_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(hit.is_some())
}

/// Student number + date of birth, as the portal login form sends them.
fn verify_login(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_no = opt_str(params, "studentNo")?;
    let dob_raw = opt_str(params, "dateOfBirth")?;
    let (Some(student_no), Some(dob_raw)) = (student_no, dob_raw) else {
        return Err(HandlerErr::bad_params(
            "Student ID and Date of Birth are required",
        ));
    };
    let Some(dob) = parse_any_date(&dob_raw) else {
        return Err(HandlerErr::new("unauthorized", BAD_LOGIN));
    };
    let sql = format!(
        "SELECT {} FROM students WHERE student_no = ? AND date_of_birth = ?",
        STUDENT_COLUMNS
    );
    let row = conn
        .query_row(&sql, (&student_no, iso(dob)), student_json)
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    row.ok_or_else(|| HandlerErr::new("unauthorized", BAD_LOGIN))
}

fn handle_auth_student(state: &mut AppState, req: &Request) -> Value {
    let result = require_conn(state)
        .and_then(|conn| verify_login(conn, &req.params))
        .map(|s| {
            json!({
                "student": {
                    "id": s["id"],
                    "studentNo": s["studentNo"],
                    "name": s["name"],
                    "email": s["email"],
                    "department": s["department"],
                    "year": s["year"],
                }
            })
        });
    respond(&req.id, result)
}

fn handle_students_profile(state: &mut AppState, req: &Request) -> Value {
    let result = require_conn(state)
        .and_then(|conn| verify_login(conn, &req.params))
        .map(|profile| json!({ "profile": profile }));
    respond(&req.id, result)
}

fn students_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let search = opt_str(params, "search")?;
    let department = opt_str(params, "department")?;

    let sql = format!(
        "SELECT {} FROM students
         WHERE (?1 IS NULL OR student_no LIKE '%' || ?1 || '%' OR name LIKE '%' || ?1 || '%')
           AND (?2 IS NULL OR department = ?2)
         ORDER BY name COLLATE NOCASE, student_no",
        STUDENT_COLUMNS
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let students = stmt
        .query_map((search.as_deref(), department.as_deref()), student_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "students": students }))
}

fn students_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let f = parse_student_fields(params)?;
    if student_no_taken(conn, &f.student_no, None)? {
        return Err(HandlerErr::new("conflict", "student number already exists")
            .with_details(json!({ "studentNo": f.student_no })));
    }
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(id, student_no, name, email, department, year, semester, date_of_birth, phone, address)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            f.student_no,
            f.name,
            f.email,
            f.department,
            f.year,
            f.semester,
            f.date_of_birth,
            f.phone,
            f.address
        ],
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "students" })))?;
    Ok(json!({ "studentId": id }))
}

fn students_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = req_str(params, "id")?;
    let f = parse_student_fields(params)?;
    if student_no_taken(conn, &f.student_no, Some(&id))? {
        return Err(HandlerErr::new("conflict", "student number already exists")
            .with_details(json!({ "studentNo": f.student_no })));
    }
    let changed = conn
        .execute(
            "UPDATE students SET student_no = ?, name = ?, email = ?, department = ?, year = ?,
                 semester = ?, date_of_birth = ?, phone = ?, address = ?
             WHERE id = ?",
            rusqlite::params![
                f.student_no,
                f.name,
                f.email,
                f.department,
                f.year,
                f.semester,
                f.date_of_birth,
                f.phone,
                f.address,
                id
            ],
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("student"));
    }
    Ok(json!({ "ok": true }))
}

fn students_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = req_str(params, "id")?;
    let open: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM book_borrowings WHERE student_id = ? AND actual_return_date IS NULL",
            [&id],
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if open > 0 {
        return Err(HandlerErr::new("conflict", "student still has unreturned books")
            .with_details(json!({ "openBorrowings": open })));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute("DELETE FROM term_exam_marks WHERE student_id = ?", [&id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "term_exam_marks" })))?;
    tx.execute("DELETE FROM book_borrowings WHERE student_id = ?", [&id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "book_borrowings" })))?;
    let removed = tx
        .execute("DELETE FROM students WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "students" })))?;
    if removed == 0 {
        return Err(HandlerErr::not_found("student"));
    }
    tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "auth.student" => Some(handle_auth_student(state, req)),
        "students.profile" => Some(handle_students_profile(state, req)),
        "students.list" => Some(with_conn(state, req, students_list)),
        "students.create" => Some(with_conn(state, req, students_create)),
        "students.update" => Some(with_conn(state, req, students_update)),
        "students.delete" => Some(with_conn(state, req, students_delete)),
        _ => None,
    }
}
