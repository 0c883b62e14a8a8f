// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// repetier-monitor: headless host for the Repetier link.
//
// Entry point. Initialises logging and the host services, selects a machine
// and logs what its session reports until Ctrl-C.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use repetier_core::config::PrinterPreferences;
use repetier_store::ManualInstance;

use repetier_app::HostServices;
use repetier_app::services::data_dir;
use repetier_app::state::{self, MonitorState};

/// How often the status summary is logged.
const SUMMARY_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "repetier-monitor", version, about = "Watch a Repetier-Server printer")]
struct Args {
    /// Id of the instance to connect (the mDNS name or a manual name).
    #[arg(long)]
    instance: String,

    /// API key; stored for the instance. The stored key is used otherwise.
    #[arg(long)]
    api_key: Option<String>,

    /// Directory for config.json and preferences.json.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Add a manual instance, `name=host:port[/path]`. Repeatable.
    #[arg(long = "manual", value_parser = parse_manual)]
    manual: Vec<(String, ManualInstance)>,
}

/// Parse `name=host:port[/path]`. IPv6 hosts go in brackets.
fn parse_manual(raw: &str) -> Result<(String, ManualInstance), String> {
    let (name, target) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=host:port, got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err("instance name is empty".into());
    }
    let (authority, path) = match target.find('/') {
        Some(i) => (&target[..i], &target[i..]),
        None => (target, "/"),
    };
    let (host, port) = authority
        .rsplit_once(':')
        .ok_or_else(|| format!("missing port in '{target}'"))?;
    if host.is_empty() || host.ends_with(':') {
        return Err(format!("missing host in '{target}'"));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| format!("invalid port '{port}'"))?;

    let mut entry = ManualInstance::new(host, port);
    entry.path = path.to_owned();
    Ok((name.to_owned(), entry))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(instance = %args.instance, "repetier-monitor starting");

    let svc = match open_services(args.data_dir.clone()) {
        Some(svc) => svc,
        None => std::process::exit(1),
    };

    if let Err(e) = run(&svc, args).await {
        error!(error = %e, "{}", state::error_line(&e));
    }
    svc.shutdown();
}

fn open_services(requested: Option<PathBuf>) -> Option<HostServices> {
    let dir = match requested {
        Some(dir) => Ok(dir),
        None => data_dir::data_dir(),
    };
    let opened = dir
        .map_err(repetier_core::error::RepetierError::from)
        .and_then(|dir| HostServices::init(&dir));
    match opened {
        Ok(svc) => Some(svc),
        Err(e) => {
            error!(error = %e, "persistent storage failed, using in-memory fallback");
            match HostServices::fallback() {
                Ok(svc) => Some(svc),
                Err(e) => {
                    error!(error = %e, "cannot initialise host services");
                    None
                }
            }
        }
    }
}

async fn run(svc: &HostServices, args: Args) -> repetier_core::error::Result<()> {
    for (name, entry) in args.manual {
        svc.add_manual_instance(&name, entry)?;
    }
    if let Some(key) = &args.api_key {
        svc.set_api_key(&args.instance, key)?;
    }
    svc.select_machine(Some(&args.instance), PrinterPreferences::default())?;
    svc.start_discovery();

    let mut ticker = tokio::time::interval(SUMMARY_INTERVAL);
    let mut lookup = tokio::time::interval(svc.config().poll_interval);
    let mut events = None;
    let mut view = MonitorState::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                return Ok(());
            }
            _ = lookup.tick(), if events.is_none() => {
                if let Some(session) = svc.registry().get(&args.instance) {
                    info!(url = %session.descriptor().base_url(), "instance found");
                    events = Some(session.subscribe());
                    view.refresh(svc.statuses());
                }
            }
            received = recv(&mut events) => match received {
                Ok(event) => {
                    if let Some(line) = view.apply(&args.instance, &event) {
                        info!("{line}");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "session events dropped");
                    view.refresh(svc.statuses());
                }
                Err(RecvError::Closed) => {
                    warn!("session went away, waiting for it to return");
                    events = None;
                }
            },
            _ = ticker.tick() => {
                view.refresh(svc.statuses());
                if view.get(&args.instance).is_none() {
                    info!(instance = %args.instance, "instance not discovered yet");
                }
                for line in view.summary() {
                    info!("{line}");
                }
            }
        }
    }
}

/// Next event from the subscription, pending forever without one.
async fn recv(
    events: &mut Option<tokio::sync::broadcast::Receiver<repetier_net::SessionEvent>>,
) -> Result<repetier_net::SessionEvent, RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_spec_with_path() {
        let (name, entry) = parse_manual("garage=192.168.1.30:3344/repetier").unwrap();
        assert_eq!(name, "garage");
        assert_eq!(entry.address, "192.168.1.30");
        assert_eq!(entry.port, 3344);
        assert_eq!(entry.path, "/repetier");
    }

    #[test]
    fn manual_spec_defaults_path_and_accepts_ipv6() {
        let (_, entry) = parse_manual("lab=[fe80::1]:80").unwrap();
        assert_eq!(entry.address, "[fe80::1]");
        assert_eq!(entry.port, 80);
        assert_eq!(entry.path, "/");
    }

    #[test]
    fn malformed_manual_specs_are_rejected() {
        assert!(parse_manual("garage").is_err());
        assert!(parse_manual("=host:80").is_err());
        assert!(parse_manual("garage=host").is_err());
        assert!(parse_manual("garage=host:http").is_err());
        assert!(parse_manual("garage=:80").is_err());
    }

    #[test]
    fn cli_accepts_repeated_manual_instances() {
        let args = Args::try_parse_from([
            "repetier-monitor",
            "--instance",
            "garage",
            "--manual",
            "garage=10.0.0.6:3344",
            "--manual",
            "lab=10.0.0.7:3344/r",
        ])
        .unwrap();
        assert_eq!(args.instance, "garage");
        assert_eq!(args.manual.len(), 2);
        assert!(args.api_key.is_none());
    }
}
