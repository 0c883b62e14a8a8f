// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Criterion benchmarks for the poll-cycle hot path: parsing stateList and
// listPrinter replies, and resolving webcam URLs.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use serde_json::{Value, json};

use repetier_core::types::InstanceDescriptor;
use repetier_net::camera::normalize_camera_url;
use repetier_net::payload::{parse_job_list, parse_json, parse_state_list};

// ---------------------------------------------------------------------------
// Helpers: server replies for a multi-printer instance
// ---------------------------------------------------------------------------

fn state_list_body(printers: usize) -> Vec<u8> {
    let mut map = serde_json::Map::new();
    for i in 0..printers {
        map.insert(
            format!("printer{i}"),
            json!({
                "numExtruder": 2,
                "extruder": [
                    {"tempSet": 215.0, "tempRead": 214.61},
                    {"tempSet": 0.0, "tempRead": 24.3}
                ],
                "heatedBeds": [{"tempSet": 60.0, "tempRead": 59.87}]
            }),
        );
    }
    Value::Object(map).to_string().into_bytes()
}

fn job_list_body(printers: usize) -> Vec<u8> {
    let list: Vec<Value> = (0..printers)
        .map(|i| {
            json!({
                "slug": format!("printer{i}"),
                "job": format!("part_{i}.gcode"),
                "online": 1,
                "paused": false,
                "start": 1_700_000_000,
                "printTime": 5400.0,
                "printedTimeComp": 1234.5,
                "done": 22.8
            })
        })
        .collect();
    Value::Array(list).to_string().into_bytes()
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

/// Parse a stateList reply and pick the last of eight printers.
fn bench_state_list(c: &mut Criterion) {
    let body = state_list_body(8);

    c.bench_function("parse_state_list (8 printers)", |b| {
        b.iter(|| {
            let json = parse_json(black_box(&body));
            let update = parse_state_list(&json, "printer7");
            assert!(matches!(update, Ok(Some(_))));
        });
    });
}

/// Parse a listPrinter reply; the slug lookup is linear, so the last entry
/// is the worst case.
fn bench_job_list(c: &mut Criterion) {
    let body = job_list_body(8);

    c.bench_function("parse_job_list (8 printers)", |b| {
        b.iter(|| {
            let json = parse_json(black_box(&body));
            let update = parse_job_list(&json, "printer7");
            assert!(matches!(update, Ok(Some(_))));
        });
    });
}

fn bench_camera_url(c: &mut Criterion) {
    let instance = InstanceDescriptor::new("office", "192.168.1.20", 3344);
    let inputs = [
        "http://127.0.0.1:8080/?action=stream",
        "//cam:81/mjpg",
        ":8080/?action=stream",
        "/webcam/?action=stream",
    ];

    c.bench_function("normalize_camera_url (4 forms)", |b| {
        b.iter(|| {
            for raw in inputs {
                black_box(normalize_camera_url(black_box(raw), &instance));
            }
        });
    });
}

criterion_group!(benches, bench_state_list, bench_job_list, bench_camera_url);
criterion_main!(benches);
