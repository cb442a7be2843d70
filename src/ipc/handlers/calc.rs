use crate::calc::{compute_grade, BorrowingDates, CalcConfig, ComponentMark, ExamComponent};
use crate::config::{apply_calc_config_patch, calc_config_is_overridden, CALC_CONFIG_KEY};
use crate::db;
use crate::ipc::helpers::{effective_config, iso, opt_i64, opt_str, respond, today_param, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

/// Workspace overrides when a workspace is open, built-in constants otherwise.
fn config_for(state: &AppState) -> Result<CalcConfig, HandlerErr> {
    match state.db.as_ref() {
        Some(conn) => effective_config(conn),
        None => Ok(CalcConfig::default()),
    }
}

fn rows_param<T: DeserializeOwned>(params: &Value, key: &str) -> Result<Vec<T>, HandlerErr> {
    let Some(v) = params.get(key) else {
        return Err(HandlerErr::bad_params(format!("missing {}", key)));
    };
    serde_json::from_value(v.clone())
        .map_err(|e| HandlerErr::bad_params(format!("{} is malformed: {}", key, e)))
}

fn calc_grade(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let components: Vec<ExamComponent> = rows_param(params, "components")?;
    let marks: Vec<ComponentMark> = rows_param(params, "marks")?;
    let cfg = config_for(state)?;
    let result = compute_grade(&components, &marks, &cfg.grade_thresholds)?;
    Ok(json!({
        "normalizedTotal": result.normalized_total,
        "totalWeight": result.total_weight,
        "grade": result.grade,
        "complete": result.is_complete(),
    }))
}

fn calc_borrowing(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let due = opt_str(params, "dueDate")?;
    let actual = opt_str(params, "actualReturnDate")?;
    let dates = BorrowingDates::parse(due.as_deref(), actual.as_deref())?;
    let today = today_param(params)?;
    let fee_per_day = match opt_i64(params, "feePerDay")? {
        Some(n) if n < 0 => return Err(HandlerErr::bad_params("feePerDay must be >= 0")),
        Some(n) => n,
        None => config_for(state)?.late_fee_per_day,
    };
    let eval = dates.evaluate(today, fee_per_day);
    Ok(json!({
        "today": iso(today),
        "feePerDay": fee_per_day,
        "daysLate": eval.days_late,
        "fee": eval.fee,
        "status": eval.status,
    }))
}

fn config_json(conn: &Connection) -> Result<Value, HandlerErr> {
    let cfg = effective_config(conn)?;
    let overridden =
        calc_config_is_overridden(conn).map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "config": cfg, "overridden": overridden }))
}

fn calc_config_get(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    config_json(conn)
}

fn calc_config_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let Some(patch) = params.get("patch").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("missing params.patch object"));
    };
    let mut next = effective_config(conn)?;
    apply_calc_config_patch(&mut next, patch).map_err(|msg| HandlerErr::bad_params(msg))?;
    let saved = serde_json::to_value(next).map_err(|e| HandlerErr::new("internal", e.to_string()))?;
    db::settings_set_json(conn, CALC_CONFIG_KEY, &saved)
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    tracing::info!(
        a = next.grade_thresholds.a,
        b = next.grade_thresholds.b,
        c = next.grade_thresholds.c,
        late_fee_per_day = next.late_fee_per_day,
        "calc config updated"
    );
    config_json(conn)
}

fn calc_config_clear(conn: &Connection, _params: &Value) -> Result<Value, HandlerErr> {
    let removed = db::settings_delete(conn, CALC_CONFIG_KEY)
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    if removed {
        tracing::info!("calc config reset to defaults");
    }
    let mut out = config_json(conn)?;
    out["removed"] = json!(removed);
    Ok(out)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "calc.grade" => Some(respond(&req.id, calc_grade(state, &req.params))),
        "calc.borrowing" => Some(respond(&req.id, calc_borrowing(state, &req.params))),
        "calc.config.get" => Some(with_conn(state, req, calc_config_get)),
        "calc.config.update" => Some(with_conn(state, req, calc_config_update)),
        "calc.config.clear" => Some(with_conn(state, req, calc_config_clear)),
        _ => None,
    }
}
