// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Parsing of Repetier-Server JSON responses.
//
// The server's payloads are loosely typed (numbers may be null, flags may be
// 0/1 or booleans), so everything is read through `serde_json::Value` rather
// than strict structs. Structural problems in the slug's own entry surface as
// `MalformedBody`; a body that is not JSON at all is treated as empty.

use serde_json::{Map, Value};
use tracing::warn;

use repetier_core::error::{RepetierError, Result};
use repetier_core::types::{JobSnapshot, PrinterState, Temperature};

/// Sentinel job name meaning "no active job".
pub const NO_JOB: &str = "none";

/// Parse a response body, treating anything that is not JSON as `{}`.
pub fn parse_json(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Object(Map::new());
    }
    serde_json::from_slice(body).unwrap_or_else(|e| {
        warn!(error = %e, "received invalid JSON from Repetier");
        Value::Object(Map::new())
    })
}

/// Python-style truthiness of a JSON value.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

// ---------------------------------------------------------------------------
// stateList
// ---------------------------------------------------------------------------

/// Temperatures reported by `?a=stateList` for one printer.
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    /// Per-extruder temperatures. `None` when the server did not report an
    /// extruder count, in which case the previous values stay.
    pub extruders: Option<Vec<Temperature>>,
    pub bed: Temperature,
}

/// Extract the entry for `slug` from a `stateList` response.
///
/// Returns `Ok(None)` when the response has no entry for the slug.
pub fn parse_state_list(json: &Value, slug: &str) -> Result<Option<StateUpdate>> {
    let Some(entry) = json.get(slug) else {
        return Ok(None);
    };

    let extruders = match entry.get("numExtruder") {
        None => None,
        Some(count) => {
            let count = count
                .as_u64()
                .ok_or_else(|| malformed(slug, "numExtruder is not a count"))?
                as usize;
            Some(parse_extruders(entry, slug, count)?)
        }
    };

    let bed = match entry.get("heatedBed") {
        Some(bed) => bed_temperature(bed),
        None => match entry.get("heatedBeds").and_then(|b| b.get(0)) {
            Some(bed) => bed_temperature(bed),
            None => Temperature::new(0.0, -1.0),
        },
    };

    Ok(Some(StateUpdate { extruders, bed }))
}

fn parse_extruders(entry: &Value, slug: &str, count: usize) -> Result<Vec<Temperature>> {
    let Some(list) = entry.get("extruder") else {
        return Ok(vec![Temperature::new(0.0, 0.0); count]);
    };
    (0..count)
        .map(|index| {
            let tool = list
                .get(index)
                .ok_or_else(|| malformed(slug, &format!("extruder {index} missing")))?;
            let target = tool.get("tempSet").and_then(Value::as_f64);
            let actual = tool.get("tempRead").and_then(Value::as_f64);
            match (target, actual) {
                (Some(target), Some(actual)) => Ok(Temperature::new(target, actual)),
                _ => Err(malformed(slug, &format!("extruder {index} has no temperatures"))),
            }
        })
        .collect()
}

/// Bed temperatures, with `-1` standing in for values the server reports as null.
fn bed_temperature(bed: &Value) -> Temperature {
    let read = |key: &str| bed.get(key).and_then(Value::as_f64).unwrap_or(-1.0);
    Temperature::new(read("tempSet"), read("tempRead"))
}

// ---------------------------------------------------------------------------
// listPrinter
// ---------------------------------------------------------------------------

/// Job and printer state derived from `?a=listPrinter`.
#[derive(Debug, Clone, PartialEq)]
pub struct JobUpdate {
    pub job: JobSnapshot,
    pub printer_state: PrinterState,
}

/// Index of the first entry whose `slug` equals `slug`.
///
/// Entries are scanned in order and the first match wins, even if several
/// entries share the slug.
pub fn printer_index(list: &[Value], slug: &str) -> Option<usize> {
    list.iter()
        .position(|p| p.get("slug").and_then(Value::as_str) == Some(slug))
}

/// Extract the job of `slug` from a `listPrinter` response.
///
/// Returns `Ok(None)` when the response is not a list or has no entry for the
/// slug.
pub fn parse_job_list(json: &Value, slug: &str) -> Result<Option<JobUpdate>> {
    let Some(list) = json.as_array() else {
        return Ok(None);
    };
    let Some(index) = printer_index(list, slug) else {
        return Ok(None);
    };
    let entry = &list[index];
    if !entry.is_object() {
        return Err(malformed(slug, "printer entry is not an object"));
    }

    let job = match entry.get("job") {
        None | Some(Value::Null) => JobSnapshot::idle(),
        Some(Value::String(name)) if name == NO_JOB => JobSnapshot::idle(),
        Some(Value::String(name)) => active_job(entry, name),
        Some(_) => return Err(malformed(slug, "job is not a string")),
    };

    let online = entry.get("online").map(truthy).unwrap_or(true);
    let printer_state = if online { job.state } else { PrinterState::Offline };

    Ok(Some(JobUpdate { job, printer_state }))
}

fn active_job(entry: &Value, name: &str) -> JobSnapshot {
    let paused = entry.get("paused").is_some_and(truthy);
    let number = |key: &str| entry.get(key).and_then(Value::as_f64).unwrap_or(0.0);

    let (time_elapsed, time_total) = if entry.get("start").is_some_and(truthy) {
        let total = number("printTime");
        let compensated = number("printedTimeComp");
        let elapsed = if compensated != 0.0 {
            compensated
        } else {
            total * number("done") / 100.0
        };
        (elapsed, total)
    } else {
        (0.0, 0.0)
    };

    JobSnapshot {
        name: name.to_owned(),
        state: if paused { PrinterState::Paused } else { PrinterState::Printing },
        time_elapsed,
        time_total,
        progress: number("done"),
    }
}

// ---------------------------------------------------------------------------
// getPrinterConfig
// ---------------------------------------------------------------------------

/// Settings extracted from `?a=getPrinterConfig`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PrinterConfigUpdate {
    /// `general.sdcard`, when reported.
    pub sd_supported: Option<bool>,
    /// Raw camera URL. `None` when the server has no webcam section; an empty
    /// string when it has one without a usable URL.
    pub camera_url: Option<String>,
}

/// Extract SD support and the raw webcam URL. Newer servers report a
/// `webcams` array, older ones a single `webcam` object; the array wins.
pub fn parse_printer_config(json: &Value) -> PrinterConfigUpdate {
    let sd_supported = json
        .get("general")
        .and_then(|g| g.get("sdcard"))
        .map(truthy);

    let dynamic_url = |cam: &Value| {
        cam.get("dynamicUrl")
            .map(|url| url.as_str().unwrap_or_default().to_owned())
    };
    let camera_url = json
        .get("webcams")
        .and_then(|list| list.get(0))
        .and_then(dynamic_url)
        .or_else(|| json.get("webcam").and_then(dynamic_url));

    PrinterConfigUpdate {
        sd_supported,
        camera_url,
    }
}

// ---------------------------------------------------------------------------
// printer/info and listModelGroups
// ---------------------------------------------------------------------------

/// A printer listed by `printer/info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrinterEntry {
    pub slug: String,
    pub name: String,
}

/// Server overview from `printer/info`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerInfo {
    pub printers: Vec<PrinterEntry>,
    /// Key handed out to clients on servers without access control.
    pub api_key: Option<String>,
    pub version: Option<String>,
}

pub fn parse_server_info(json: &Value) -> ServerInfo {
    let printers = json
        .get("printers")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|p| {
                    let slug = p.get("slug")?.as_str()?.to_owned();
                    let name = p
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or(&slug)
                        .to_owned();
                    Some(PrinterEntry { slug, name })
                })
                .collect()
        })
        .unwrap_or_default();

    let text = |key: &str| {
        json.get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from)
    };

    ServerInfo {
        printers,
        api_key: text("apikey"),
        version: text("version"),
    }
}

/// Model group names from `?a=listModelGroups`.
pub fn parse_model_groups(json: &Value) -> Vec<String> {
    json.get("groupNames")
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn malformed(slug: &str, detail: &str) -> RepetierError {
    RepetierError::MalformedBody(format!("{slug}: {detail}"))
}
