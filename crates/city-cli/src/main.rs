use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use city_api::{default_move_log_path, serve, MoveStore};
use city_core::{RecordingOutbox, SessionCoordinator};
use contracts::{MoveSubmission, SessionConfig, TurnNotice};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_HISTORY_LIMIT: usize = 50;

fn print_usage() {
    println!("city-cli <command>");
    println!("commands:");
    println!("  status [config.json]");
    println!("  serve [addr] [config.json]");
    println!("    default addr: {DEFAULT_ADDR}");
    println!("    move log: $CITY_MOVE_LOG (default move_log.csv; .sqlite/.db for sqlite)");
    println!("  simulate <moves> [participants] [seed] [log_path]");
    println!("    plays greedy participants headlessly and reports social utility");
    println!("  history [log_path] [limit] [session_id]");
    println!("    prints logged moves from a sqlite move log");
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_usize(value: Option<&String>, label: &str) -> Result<usize, String> {
    let raw = value.ok_or_else(|| format!("missing {label}"))?;
    raw.parse::<usize>()
        .map_err(|_| format!("invalid {label}: {raw}"))
}

fn parse_socket_addr(value: Option<&String>) -> Result<SocketAddr, String> {
    let raw = value.map(String::as_str).unwrap_or(DEFAULT_ADDR);
    raw.parse::<SocketAddr>()
        .map_err(|_| format!("invalid addr: {raw}"))
}

fn load_config(path: Option<&String>) -> Result<SessionConfig, String> {
    let config = match path {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .map_err(|err| format!("failed to read config {path}: {err}"))?;
            serde_json::from_str::<SessionConfig>(&raw)
                .map_err(|err| format!("failed to parse config {path}: {err}"))?
        }
        None => SessionConfig::default(),
    };
    config
        .validate()
        .map_err(|err| format!("invalid config: {err}"))?;
    Ok(config)
}

fn show_status(args: &[String]) -> Result<(), String> {
    let config = load_config(args.get(2))?;
    let session =
        SessionCoordinator::from_config(&config, RecordingOutbox::default(), MoveStore::Disabled)
            .map_err(|err| format!("failed to build session: {err}"))?;

    println!("{}", session.session_status());
    let snapshot = serde_json::to_string_pretty(&session.city().snapshot(None))
        .map_err(|err| format!("failed to encode snapshot: {err}"))?;
    println!("{snapshot}");
    Ok(())
}

/// Destination with the best personal utility delta among blocks with room.
fn greedy_destination(notice: &TurnNotice, capacity: u32) -> Option<usize> {
    let from_idx = notice.from_idx?;
    notice
        .city
        .delta_us
        .iter()
        .enumerate()
        .filter(|&(idx, _)| idx != from_idx && notice.city.occupied[idx] < capacity)
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(idx, _)| idx)
}

fn run_simulation(args: &[String]) -> Result<(), String> {
    let moves = parse_usize(args.get(2), "moves")?;
    let participants = args
        .get(3)
        .map(|_| parse_usize(args.get(3), "participants"))
        .transpose()?
        .unwrap_or(4)
        .max(1);
    let seed = args
        .get(4)
        .map(|raw| raw.parse::<u64>().map_err(|_| format!("invalid seed: {raw}")))
        .transpose()?;
    let store = match args.get(5) {
        Some(path) => MoveStore::open(path, "simulation")
            .map_err(|err| format!("failed to open move log {path}: {err}"))?,
        None => MoveStore::Disabled,
    };

    let config = SessionConfig {
        session_id: "simulation".to_string(),
        seed,
        ..SessionConfig::default()
    };
    let mut session = SessionCoordinator::from_config(&config, RecordingOutbox::default(), store)
        .map_err(|err| format!("failed to build session: {err}"))?;

    let initial_social = session.city().compute_metrics(None).social_utility;
    for p in 0..participants {
        session.on_participant_join(&format!("bot-{p}"));
    }

    while (session.moves_applied() as usize) < moves {
        let Some(notice) = session.turn_notice() else {
            break;
        };
        let (Some(from_idx), Some(to_idx)) =
            (notice.from_idx, greedy_destination(&notice, config.capacity))
        else {
            info!(moves_applied = session.moves_applied(), "no feasible move left");
            break;
        };

        session.on_move_submitted(&MoveSubmission {
            student_id: notice.student_id.clone(),
            from_idx: from_idx as i64,
            to_idx: to_idx as i64,
        });
        session.outbox_mut().take();
    }

    if let Some(error) = session.last_persistence_error() {
        return Err(format!("persistence error after simulation: {error}"));
    }

    let final_social = session.city().compute_metrics(None).social_utility;
    println!(
        "simulated moves={} participants={} social_utility={:.3}->{:.3} occupied={:?} store={}",
        session.moves_applied(),
        participants,
        initial_social,
        final_social,
        session.city().occupied(),
        session.move_log().describe()
    );
    Ok(())
}

fn show_history(args: &[String]) -> Result<(), String> {
    let path = args
        .get(2)
        .cloned()
        .filter(|path| !path.trim().is_empty())
        .unwrap_or_else(default_move_log_path);
    let limit = args
        .get(3)
        .map(|_| parse_usize(args.get(3), "limit"))
        .transpose()?
        .unwrap_or(DEFAULT_HISTORY_LIMIT);
    let session_id = args
        .get(4)
        .cloned()
        .unwrap_or_else(|| SessionConfig::default().session_id);

    if !Path::new(&path).exists() {
        return Err(format!("no move log at {path}"));
    }

    let store = MoveStore::open(&path, &session_id)
        .map_err(|err| format!("failed to open move log {path}: {err}"))?;
    let moves = store
        .load_moves(0, limit)
        .map_err(|err| format!("failed to read move log {path}: {err}"))?;

    for record in &moves {
        let line = serde_json::to_string(record)
            .map_err(|err| format!("failed to encode move: {err}"))?;
        println!("{line}");
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str);

    let result = match command {
        Some("status") => show_status(&args),
        Some("serve") => {
            let addr = match parse_socket_addr(args.get(2)) {
                Ok(addr) => addr,
                Err(err) => {
                    eprintln!("error: {err}");
                    print_usage();
                    std::process::exit(2);
                }
            };
            let config = match load_config(args.get(3)) {
                Ok(config) => config,
                Err(err) => {
                    eprintln!("error: {err}");
                    std::process::exit(2);
                }
            };
            let log_path = default_move_log_path();
            match MoveStore::open(&log_path, &config.session_id) {
                Ok(store) => {
                    println!("serving classroom session on http://{addr} (move log: {log_path})");
                    serve(addr, &config, store)
                        .await
                        .map_err(|err| format!("server error: {err}"))
                }
                Err(err) => Err(format!("failed to open move log {log_path}: {err}")),
            }
        }
        Some("simulate") => {
            if args.get(2).is_none() {
                eprintln!("error: missing moves");
                print_usage();
                std::process::exit(2);
            }
            run_simulation(&args)
        }
        Some("history") => show_history(&args),
        _ => {
            print_usage();
            std::process::exit(2);
        }
    };

    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
