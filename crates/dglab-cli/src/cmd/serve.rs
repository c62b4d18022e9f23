use crate::cmd::qr::print_pairing;
use crate::output::print_json;
use anyhow::Context;
use dglab_core::config::{Config, WarnLevel};
use dglab_core::{DeathKind, HostEvent, Orchestrator};
use dglab_server::DgLabServer;
use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

const USAGE: &str = "expected: damage <n> | death [normal|non-lethal|frost] | stop | status";

/// One line of host input.
#[derive(Debug, PartialEq)]
enum HostLine {
    Event(HostEvent),
    Stop,
    Status,
}

fn parse_line(line: &str) -> Result<HostLine, String> {
    let mut words = line.split_whitespace();
    let verb = words.next().unwrap_or_default();
    let arg = words.next();
    if words.next().is_some() {
        return Err(format!("too many arguments in '{line}'"));
    }

    match (verb, arg) {
        ("damage", Some(n)) => {
            let magnitude = n
                .parse::<i32>()
                .map_err(|_| format!("damage needs an integer, got '{n}'"))?;
            Ok(HostLine::Event(HostEvent::Damage { magnitude }))
        }
        ("damage", None) => Err("damage needs a magnitude".to_string()),
        ("death", kind) => {
            let kind = match kind {
                Some(k) => k.parse::<DeathKind>().map_err(|e| e.to_string())?,
                None => DeathKind::Normal,
            };
            Ok(HostLine::Event(HostEvent::Death { kind }))
        }
        ("stop", None) => Ok(HostLine::Stop),
        ("status", None) => Ok(HostLine::Status),
        _ => Err(format!("unrecognized input '{line}'")),
    }
}

pub fn run(path: &Path, port: Option<u16>, json: bool) -> anyhow::Result<()> {
    let mut config = Config::load_or_default(path).context("failed to load config")?;
    if !config.enabled {
        println!("dglab is disabled in {}; nothing to do.", path.display());
        return Ok(());
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let errors: Vec<String> = config
        .validate()
        .into_iter()
        .filter(|w| w.level == WarnLevel::Error)
        .map(|w| w.message)
        .collect();
    if !errors.is_empty() {
        anyhow::bail!("invalid config: {}", errors.join("; "));
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(serve(config, json))
}

async fn serve(config: Config, json: bool) -> anyhow::Result<()> {
    let public_host = config.server.public_host.clone();
    let server = Arc::new(DgLabServer::new(&config.server));
    let orchestrator = Orchestrator::new(config, Arc::clone(&server));

    let control = orchestrator
        .start()
        .await
        .context("failed to start the control channel")?;

    let url = server
        .pairing_url(public_host.as_deref())
        .context("control channel stopped before pairing")?;
    if json {
        print_json(&serde_json::json!({
            "control_identity": control,
            "port": server.port(),
            "url": url,
        }))?;
    } else {
        println!("Controller {control}");
        print_pairing(&url)?;
        println!("{USAGE}");
        println!("Ctrl+C or end of input to stop");
    }

    let mut lines = stdin_lines();
    loop {
        tokio::select! {
            line = lines.recv() => match line {
                Some(line) => {
                    let line = line.context("failed to read stdin")?;
                    handle_line(&orchestrator, line.trim(), json).await?;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    orchestrator
        .shutdown()
        .await
        .context("failed to shut down cleanly")?;
    if !json {
        println!("Stopped.");
    }
    Ok(())
}

/// Stdin lines, read on a detached thread so a pending read never holds up
/// runtime shutdown.
fn stdin_lines() -> mpsc::Receiver<std::io::Result<String>> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

async fn handle_line(
    orchestrator: &Orchestrator<DgLabServer>,
    line: &str,
    json: bool,
) -> anyhow::Result<()> {
    if line.is_empty() {
        return Ok(());
    }
    let parsed = match parse_line(line) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("{e} ({USAGE})");
            return Ok(());
        }
    };

    match parsed {
        HostLine::Event(event) => {
            let class = event.class();
            let accepted = match event {
                HostEvent::Damage { magnitude } => orchestrator.handle_damage_event(magnitude),
                HostEvent::Death { kind } => orchestrator.handle_death_event(kind),
            };
            if json {
                print_json(&serde_json::json!({ "event": class, "accepted": accepted }))?;
            } else if accepted {
                println!("{class}: dispatching");
            } else {
                println!("{class}: dropped");
            }
        }
        HostLine::Stop => {
            let ok = orchestrator.emergency_stop().await;
            if json {
                print_json(&serde_json::json!({ "emergency_stop": ok }))?;
            } else if ok {
                println!("emergency stop: all channels cleared");
            } else {
                println!("emergency stop: not every channel confirmed");
            }
        }
        HostLine::Status => {
            let status = orchestrator.status();
            if json {
                print_json(&status)?;
            } else {
                println!("{}", status.summary());
            }
        }
    }
    Ok(())
}
