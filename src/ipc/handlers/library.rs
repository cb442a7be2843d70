use crate::calc::BorrowingStatus;
use crate::ipc::helpers::{
    effective_config, iso, opt_str, req_date, req_i64, req_str, today_param, with_conn, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::reports::{borrowing_rows, library_report, BorrowingFilter};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

fn open_borrowings_of_book(conn: &Connection, book_id: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COUNT(*) FROM book_borrowings WHERE book_id = ? AND actual_return_date IS NULL",
        [book_id],
        |r| r.get(0),
    )
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn require_row(conn: &Connection, table: &str, id: &str, what: &str) -> Result<(), HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    let hit: Option<i64> = conn
        .query_row(&sql, [id], |r| r.get(0))
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    hit.map(|_| ()).ok_or_else(|| HandlerErr::not_found(what))
}

struct BookFields {
    title: String,
    author: String,
    isbn: Option<String>,
    total_copies: i64,
}

fn parse_book_fields(params: &Value) -> Result<BookFields, HandlerErr> {
    let total_copies = req_i64(params, "totalCopies")?;
    if total_copies < 1 {
        return Err(HandlerErr::bad_params("totalCopies must be >= 1"));
    }
    Ok(BookFields {
        title: req_str(params, "title")?,
        author: req_str(params, "author")?,
        isbn: opt_str(params, "isbn")?,
        total_copies,
    })
}

fn books_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let search = opt_str(params, "search")?;
    let mut stmt = conn
        .prepare(
            "SELECT id, title, author, isbn, total_copies, available_copies
             FROM books
             WHERE (?1 IS NULL
                    OR title LIKE '%' || ?1 || '%'
                    OR author LIKE '%' || ?1 || '%'
                    OR isbn LIKE '%' || ?1 || '%')
             ORDER BY title COLLATE NOCASE, id",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let books = stmt
        .query_map([search.as_deref()], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "author": r.get::<_, String>(2)?,
                "isbn": r.get::<_, Option<String>>(3)?,
                "totalCopies": r.get::<_, i64>(4)?,
                "availableCopies": r.get::<_, i64>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "books": books }))
}

fn books_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let f = parse_book_fields(params)?;
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO books(id, title, author, isbn, total_copies, available_copies)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&id, &f.title, &f.author, &f.isbn, f.total_copies, f.total_copies),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "books" })))?;
    Ok(json!({ "bookId": id }))
}

fn books_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = req_str(params, "id")?;
    let f = parse_book_fields(params)?;
    require_row(conn, "books", &id, "book")?;
    let borrowed = open_borrowings_of_book(conn, &id)?;
    if f.total_copies < borrowed {
        return Err(HandlerErr::bad_params(format!(
            "totalCopies cannot be lower than the {} copies currently borrowed",
            borrowed
        ))
        .with_details(json!({ "borrowed": borrowed })));
    }
    conn.execute(
        "UPDATE books SET title = ?, author = ?, isbn = ?, total_copies = ?, available_copies = ?
         WHERE id = ?",
        (
            &f.title,
            &f.author,
            &f.isbn,
            f.total_copies,
            f.total_copies - borrowed,
            &id,
        ),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    Ok(json!({ "ok": true, "availableCopies": f.total_copies - borrowed }))
}

fn books_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = req_str(params, "id")?;
    require_row(conn, "books", &id, "book")?;
    let borrowed = open_borrowings_of_book(conn, &id)?;
    if borrowed > 0 {
        return Err(HandlerErr::new("conflict", "book still has copies borrowed")
            .with_details(json!({ "borrowed": borrowed })));
    }
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute("DELETE FROM book_borrowings WHERE book_id = ?", [&id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "book_borrowings" })))?;
    tx.execute("DELETE FROM books WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": "books" })))?;
    tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    Ok(json!({ "ok": true }))
}

/// Takes one copy off the shelf; the caller owns the surrounding transaction.
fn take_copy(conn: &Connection, book_id: &str) -> Result<(), HandlerErr> {
    let available: i64 = conn
        .query_row(
            "SELECT available_copies FROM books WHERE id = ?",
            [book_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .ok_or_else(|| HandlerErr::not_found("book"))?;
    if available <= 0 {
        return Err(HandlerErr::new("no_copies_available", "no copies available")
            .with_details(json!({ "bookId": book_id })));
    }
    conn.execute(
        "UPDATE books SET available_copies = available_copies - 1 WHERE id = ?",
        [book_id],
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    Ok(())
}

fn put_copy_back(conn: &Connection, book_id: &str) -> Result<(), HandlerErr> {
    conn.execute(
        "UPDATE books SET available_copies = MIN(total_copies, available_copies + 1) WHERE id = ?",
        [book_id],
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    Ok(())
}

struct BorrowingFields {
    student_id: String,
    book_id: String,
    issue_date: NaiveDate,
    return_date: NaiveDate,
}

fn parse_borrowing_fields(params: &Value) -> Result<BorrowingFields, HandlerErr> {
    let f = BorrowingFields {
        student_id: req_str(params, "studentId")?,
        book_id: req_str(params, "bookId")?,
        issue_date: req_date(params, "issueDate")?,
        return_date: req_date(params, "returnDate")?,
    };
    if f.return_date <= f.issue_date {
        return Err(HandlerErr::bad_params("returnDate must be after issueDate"));
    }
    Ok(f)
}

fn borrowings_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let f = parse_borrowing_fields(params)?;
    require_row(conn, "students", &f.student_id, "student")?;
    require_row(conn, "books", &f.book_id, "book")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    take_copy(&tx, &f.book_id)?;
    let id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO book_borrowings(id, book_id, student_id, issue_date, return_date, actual_return_date)
         VALUES(?, ?, ?, ?, ?, NULL)",
        (
            &id,
            &f.book_id,
            &f.student_id,
            iso(f.issue_date),
            iso(f.return_date),
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "book_borrowings" })))?;
    tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    Ok(json!({ "borrowingId": id }))
}

fn load_borrowing(conn: &Connection, id: &str) -> Result<(String, Option<String>), HandlerErr> {
    conn.query_row(
        "SELECT book_id, actual_return_date FROM book_borrowings WHERE id = ?",
        [id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )
    .optional()
    .map_err(|e| HandlerErr::db("db_query_failed", e))?
    .ok_or_else(|| HandlerErr::not_found("borrowing"))
}

fn borrowings_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = req_str(params, "id")?;
    let f = parse_borrowing_fields(params)?;
    let (old_book, actual_return) = load_borrowing(conn, &id)?;
    require_row(conn, "students", &f.student_id, "student")?;
    require_row(conn, "books", &f.book_id, "book")?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    if old_book != f.book_id && actual_return.is_none() {
        take_copy(&tx, &f.book_id)?;
        put_copy_back(&tx, &old_book)?;
    }
    tx.execute(
        "UPDATE book_borrowings SET book_id = ?, student_id = ?, issue_date = ?, return_date = ?
         WHERE id = ?",
        (
            &f.book_id,
            &f.student_id,
            iso(f.issue_date),
            iso(f.return_date),
            &id,
        ),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    Ok(json!({ "ok": true }))
}

fn borrowings_return(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = req_str(params, "id")?;
    let today = today_param(params)?;
    let (book_id, actual_return) = load_borrowing(conn, &id)?;
    if let Some(returned_on) = actual_return {
        return Err(HandlerErr::new("already_returned", "book already returned")
            .with_details(json!({ "actualReturnDate": returned_on })));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute(
        "UPDATE book_borrowings SET actual_return_date = ? WHERE id = ?",
        (iso(today), &id),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    put_copy_back(&tx, &book_id)?;
    tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    let cfg = effective_config(conn)?;
    let filter = BorrowingFilter {
        borrowing_id: Some(id),
        ..BorrowingFilter::default()
    };
    let row = borrowing_rows(conn, &filter, today, &cfg)?
        .into_iter()
        .next()
        .ok_or_else(|| HandlerErr::not_found("borrowing"))?;
    Ok(json!({ "borrowing": row }))
}

fn borrowings_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let id = req_str(params, "id")?;
    let (book_id, actual_return) = load_borrowing(conn, &id)?;
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute("DELETE FROM book_borrowings WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    if actual_return.is_none() {
        put_copy_back(&tx, &book_id)?;
    }
    tx.commit().map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    Ok(json!({ "ok": true }))
}

fn borrowings_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let status = match opt_str(params, "status")? {
        None => None,
        Some(s) => Some(BorrowingStatus::parse(&s).ok_or_else(|| {
            HandlerErr::bad_params("status must be Borrowed, Overdue or Returned")
        })?),
    };
    let filter = BorrowingFilter {
        student_id: opt_str(params, "studentId")?,
        borrowing_id: None,
        status,
    };
    let today = today_param(params)?;
    let cfg = effective_config(conn)?;
    let rows = borrowing_rows(conn, &filter, today, &cfg)?;
    Ok(json!({ "today": iso(today), "borrowings": rows }))
}

fn handle_library_report(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let student_id = req_str(params, "studentId")?;
    let today = today_param(params)?;
    let cfg = effective_config(conn)?;
    let report = library_report(conn, &student_id, today, &cfg)?;
    serde_json::to_value(report).map_err(|e| HandlerErr::new("internal", e.to_string()))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "books.list" => Some(with_conn(state, req, books_list)),
        "books.create" => Some(with_conn(state, req, books_create)),
        "books.update" => Some(with_conn(state, req, books_update)),
        "books.delete" => Some(with_conn(state, req, books_delete)),
        "borrowings.list" => Some(with_conn(state, req, borrowings_list)),
        "borrowings.create" => Some(with_conn(state, req, borrowings_create)),
        "borrowings.update" => Some(with_conn(state, req, borrowings_update)),
        "borrowings.return" => Some(with_conn(state, req, borrowings_return)),
        "borrowings.delete" => Some(with_conn(state, req, borrowings_delete)),
        "library.report" => Some(with_conn(state, req, handle_library_report)),
        _ => None,
    }
}
