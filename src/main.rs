// Betting console entry point.
//
// Startup sequence:
//   1. Initialize tracing (stderr, so stdout stays clean for output)
//   2. Load configuration, copying defaults/ into config/ on first run
//   3. Build the REST client
//   4. Start the engine: opens the event stream, loads the account list
//   5. Run the console loop: one command per stdin line, updates printed
//      as they arrive
//   6. Teardown on quit

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use betting_console::api::ApiClient;
use betting_console::config;
use betting_console::engine::{self, EngineCommand, EngineHandle, EngineUpdate, ViewSnapshot};
use betting_console::store::BetStatus;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("betting_console=info,warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Logging first so everything after can be traced.
    init_tracing();
    info!("Betting console starting");

    // 2. Configuration.
    let config = config::load_config().context("failed to load configuration")?;
    info!("Server: {}", config.server.base_url);

    // 3. REST client.
    let api = ApiClient::new(
        &config.server.base_url,
        Duration::from_secs(config.server.request_timeout_secs),
    )
    .context("failed to build the REST client")?;

    // 4. Engine: event stream plus initial snapshot load.
    let mut handle = engine::start(&config, Arc::new(api));

    // 5. Console loop until the operator quits or stdin closes.
    run_console(&mut handle).await?;

    // 6. Teardown: close the stream and let the engine drain.
    handle.teardown().await;
    info!("Betting console stopped");
    Ok(())
}

/// What one input line amounts to.
enum ParsedLine {
    Command(EngineCommand),
    Quit,
    Help,
    Empty,
    Error(String),
}

async fn run_console(handle: &mut EngineHandle) -> anyhow::Result<()> {
    let commands = handle.commands.clone();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut view: Option<ViewSnapshot> = None;

    println!("betting console ready; type `help` for commands");
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break; // stdin closed
                };
                match parse_line(line.trim(), view.as_ref()) {
                    ParsedLine::Command(command) => {
                        if commands.send(command).await.is_err() {
                            break;
                        }
                    }
                    ParsedLine::Quit => break,
                    ParsedLine::Help => print_help(),
                    ParsedLine::Empty => {}
                    ParsedLine::Error(message) => println!("error: {message}"),
                }
            }

            update = handle.updates.recv() => {
                let Some(update) = update else { break };
                match update {
                    EngineUpdate::Snapshot(snapshot) => {
                        print_snapshot(&snapshot);
                        view = Some(*snapshot);
                    }
                    EngineUpdate::Connection(state) => println!("stream: {state}"),
                    EngineUpdate::LoadFailed(message) => println!("load failed: {message}"),
                    EngineUpdate::MutationFailed(message) => {
                        println!("mutation failed: {message}")
                    }
                }
            }
        }
    }
    Ok(())
}

/// Turn one input line into an engine command. `bet`, `submit`, and `cancel`
/// resolve against the focused account and selected batch of the latest
/// snapshot.
fn parse_line(line: &str, view: Option<&ViewSnapshot>) -> ParsedLine {
    let mut parts = line.split_whitespace();
    let Some(word) = parts.next() else {
        return ParsedLine::Empty;
    };
    let args: Vec<&str> = parts.collect();

    match word {
        "quit" | "exit" => ParsedLine::Quit,
        "help" => ParsedLine::Help,
        "refresh" => ParsedLine::Command(EngineCommand::Refresh),
        "focus" => match args.first().and_then(|a| a.parse().ok()) {
            Some(id) => ParsedLine::Command(EngineCommand::FocusAccount(id)),
            None => ParsedLine::Error("usage: focus <account-id>".to_string()),
        },
        "select" => match args.first().and_then(|a| a.parse().ok()) {
            Some(id) => ParsedLine::Command(EngineCommand::SelectBatch(id)),
            None => ParsedLine::Error("usage: select <batch-id>".to_string()),
        },
        "create" => match args.as_slice() {
            [name, hostname] => ParsedLine::Command(EngineCommand::CreateAccount {
                name: name.to_string(),
                hostname: hostname.to_string(),
            }),
            _ => ParsedLine::Error("usage: create <name> <hostname>".to_string()),
        },
        "delete" => match args.first().and_then(|a| a.parse().ok()) {
            Some(id) => ParsedLine::Command(EngineCommand::DeleteAccount(id)),
            None => ParsedLine::Error("usage: delete <account-id>".to_string()),
        },
        "bet" => {
            let (Some(pid), Some(raw_status)) = (args.first(), args.get(1)) else {
                return ParsedLine::Error(
                    "usage: bet <pid> <pending|successful|failed>".to_string(),
                );
            };
            let Some(status) = BetStatus::from_wire(raw_status) else {
                return ParsedLine::Error(format!("unknown status: {raw_status}"));
            };
            match current_batch(view) {
                Some((account_id, batch_id)) => {
                    ParsedLine::Command(EngineCommand::SetBetStatus {
                        account_id,
                        batch_id,
                        pid: pid.to_string(),
                        status,
                    })
                }
                None => ParsedLine::Error("no batch selected".to_string()),
            }
        }
        "submit" => match current_batch(view) {
            Some((account_id, batch_id)) => {
                ParsedLine::Command(EngineCommand::SubmitBatch { account_id, batch_id })
            }
            None => ParsedLine::Error("no batch selected".to_string()),
        },
        "cancel" => match current_batch(view) {
            Some((account_id, batch_id)) => {
                ParsedLine::Command(EngineCommand::CancelBatch { account_id, batch_id })
            }
            None => ParsedLine::Error("no batch selected".to_string()),
        },
        other => ParsedLine::Error(format!("unknown command: {other}")),
    }
}

/// Focused account and selected batch from the latest snapshot, when both
/// are set.
fn current_batch(view: Option<&ViewSnapshot>) -> Option<(i64, i64)> {
    let view = view?;
    Some((view.focused_account?, view.selected_batch?))
}

fn print_snapshot(view: &ViewSnapshot) {
    println!("accounts:");
    for account in &view.accounts {
        let marker = if Some(account.id) == view.focused_account { "*" } else { " " };
        println!("  {marker} [{}] {} ({})", account.id, account.name, account.hostname);
    }
    if view.batches.is_empty() {
        println!("no active batches");
        return;
    }
    println!("active batches:");
    for batch in &view.batches {
        let marker = if Some(batch.id) == view.selected_batch { "*" } else { " " };
        println!("  {marker} batch {} ({} bets)", batch.id, batch.bets.len());
        if Some(batch.id) == view.selected_batch {
            for bet in &batch.bets {
                println!(
                    "      {} #{} {} stake {:.2} -> {}",
                    bet.pid,
                    bet.id,
                    bet.selection,
                    bet.stake,
                    bet.status.as_str()
                );
            }
        }
    }
}

fn print_help() {
    println!("commands:");
    println!("  focus <account-id>     focus an account and load its batches");
    println!("  select <batch-id>      select a batch in the focused account");
    println!("  bet <pid> <status>     set a bet's status in the selected batch");
    println!("  submit                 submit the selected batch");
    println!("  cancel                 cancel the selected batch");
    println!("  create <name> <host>   create an account");
    println!("  delete <account-id>    delete an account");
    println!("  refresh                re-fetch accounts and the focused view");
    println!("  quit                   exit");
}
