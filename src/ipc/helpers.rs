use crate::calc::{parse_calc_date, CalcConfig, CalcError};
use crate::config::load_calc_config;
use crate::import::{parse_day_first_date, ImportError};
use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use crate::reports::ReportError;
use chrono::{Local, NaiveDate};
use rusqlite::Connection;
use serde_json::{json, Value};

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(what: &str) -> Self {
        Self::new("not_found", format!("{} not found", what))
    }

    pub fn db(code: &'static str, e: impl std::fmt::Display) -> Self {
        Self::new(code, e.to_string())
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<CalcError> for HandlerErr {
    fn from(e: CalcError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl From<ReportError> for HandlerErr {
    fn from(e: ReportError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

impl From<ImportError> for HandlerErr {
    fn from(e: ImportError) -> Self {
        Self::new(e.code(), e.to_string())
    }
}

pub fn respond(id: &str, result: Result<Value, HandlerErr>) -> Value {
    match result {
        Ok(v) => crate::ipc::error::ok(id, v),
        Err(e) => e.response(id),
    }
}

pub fn require_conn(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

/// Runs `f` against the open workspace and turns its result into a response.
pub fn with_conn<F>(state: &AppState, req: &Request, f: F) -> Value
where
    F: FnOnce(&Connection, &Value) -> Result<Value, HandlerErr>,
{
    respond(
        &req.id,
        require_conn(state).and_then(|conn| f(conn, &req.params)),
    )
}

pub fn effective_config(conn: &Connection) -> Result<CalcConfig, HandlerErr> {
    load_calc_config(conn).map_err(|e| HandlerErr::db("db_query_failed", e))
}

/// Trimmed string param; `None` when absent, null or blank.
pub fn opt_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a string", key))),
    }
}

pub fn req_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    opt_str(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn opt_f64(params: &Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .filter(|n| n.is_finite())
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a number", key))),
    }
}

pub fn req_f64(params: &Value, key: &str) -> Result<f64, HandlerErr> {
    opt_f64(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn opt_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be an integer", key))),
    }
}

pub fn req_i64(params: &Value, key: &str) -> Result<i64, HandlerErr> {
    opt_i64(params, key)?.ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn id_list(params: &Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    let Some(arr) = params.get(key).and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params(format!("{} must be an array of ids", key)));
    };
    arr.iter()
        .map(|v| {
            v.as_str()
                .map(|s| s.to_string())
                .ok_or_else(|| HandlerErr::bad_params(format!("{} must contain only strings", key)))
        })
        .collect()
}

/// Calendar date from the wire format or a day-first form. Bare numbers are
/// rejected here; spreadsheet serials are only read by the CSV importer.
pub fn parse_any_date(raw: &str) -> Option<NaiveDate> {
    parse_calc_date(raw).ok().or_else(|| parse_day_first_date(raw))
}

pub fn iso(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

pub fn req_date(params: &Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    let raw = req_str(params, key)?;
    parse_any_date(&raw).ok_or_else(|| {
        HandlerErr::new("invalid_date", format!("{} is not a valid date", key))
            .with_details(json!({ "field": key, "value": raw }))
    })
}

pub fn opt_date(params: &Value, key: &str) -> Result<Option<NaiveDate>, HandlerErr> {
    match opt_str(params, key)? {
        None => Ok(None),
        Some(_) => req_date(params, key).map(Some),
    }
}

/// "Today" is read from the clock only here, at the request boundary.
pub fn today_param(params: &Value) -> Result<NaiveDate, HandlerErr> {
    Ok(opt_date(params, "today")?.unwrap_or_else(|| Local::now().date_naive()))
}
