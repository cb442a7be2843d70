use crate::calc::CalcConfig;
use crate::db;
use rusqlite::Connection;
use serde_json::{Map, Value};

pub const CALC_CONFIG_KEY: &str = "calc.config";

fn parse_f64(v: &Value, key: &str) -> Result<f64, String> {
    v.as_f64()
        .filter(|n| n.is_finite())
        .ok_or_else(|| format!("{} must be a number", key))
}

/// Merges a camelCase patch onto `current`. The result is validated as a whole,
/// so a patch may move several thresholds at once.
pub fn apply_calc_config_patch(current: &mut CalcConfig, patch: &Map<String, Value>) -> Result<(), String> {
    for (k, v) in patch {
        match k.as_str() {
            "gradeThresholds" => {
                let Some(obj) = v.as_object() else {
                    return Err("gradeThresholds must be an object".into());
                };
                for (tk, tv) in obj {
                    match tk.as_str() {
                        "a" => current.grade_thresholds.a = parse_f64(tv, "gradeThresholds.a")?,
                        "b" => current.grade_thresholds.b = parse_f64(tv, "gradeThresholds.b")?,
                        "c" => current.grade_thresholds.c = parse_f64(tv, "gradeThresholds.c")?,
                        _ => return Err(format!("unknown gradeThresholds field: {}", tk)),
                    }
                }
            }
            "lateFeePerDay" => {
                let n = v
                    .as_i64()
                    .ok_or_else(|| "lateFeePerDay must be integer".to_string())?;
                if n < 0 {
                    return Err("lateFeePerDay must be >= 0".into());
                }
                current.late_fee_per_day = n;
            }
            _ => return Err(format!("unknown calc config field: {}", k)),
        }
    }
    current.grade_thresholds.validate()
}

pub fn load_calc_config(conn: &Connection) -> anyhow::Result<CalcConfig> {
    let mut cfg = CalcConfig::default();
    if let Some(saved) = db::settings_get_json(conn, CALC_CONFIG_KEY)? {
        if let Some(obj) = saved.as_object() {
            let mut candidate = cfg;
            match apply_calc_config_patch(&mut candidate, obj) {
                Ok(()) => cfg = candidate,
                // A stale or hand-edited override must not block grading.
                Err(msg) => tracing::warn!(error = %msg, "ignoring invalid calc config override"),
            }
        }
    }
    Ok(cfg)
}

pub fn calc_config_is_overridden(conn: &Connection) -> anyhow::Result<bool> {
    Ok(db::settings_get_json(conn, CALC_CONFIG_KEY)?.is_some())
}
