// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use kbs_client::config::{self, LOG_FORMAT_ENV};
use kbs_client::crypto::kdf;
use kbs_client::state::RecoveryStore;
use kbs_client::storage::{Database, KeyValueStore};
use kbs_client::{KbsConfig, KbsResult};

enum Command {
    Status,
    VerifyPin(String),
    Help,
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        [] | ["status"] => Ok(Command::Status),
        ["verify-pin", pin] => Ok(Command::VerifyPin(pin.to_string())),
        ["-h"] | ["--help"] | ["help"] => Ok(Command::Help),
        other => Err(format!("unrecognized arguments: {}", other.join(" "))),
    }
}

fn print_help() {
    eprintln!(
        r#"kbs-client - Key backup service client

USAGE:
    kbs-client [COMMAND]

COMMANDS:
    status              Show the locally stored key state (default)
    verify-pin <PIN>    Check a PIN against the local verification string
    help                Print this help

ENVIRONMENT VARIABLES:
    DATA_DIR            Directory holding kbs.redb (default: ./data)
    KBS_ENCLAVE         Current enclave, name:serviceIdHex[:mrenclave]
    LOG_FORMAT          json or pretty (default: pretty)
    RUST_LOG            Log level (default: info)
"#
    );
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn open_state() -> KbsResult<RecoveryStore> {
    let path = config::database_path();
    tracing::debug!(path = %path.display(), "Opening key store");
    let db: Arc<dyn KeyValueStore> = Arc::new(Database::open(&path)?);
    Ok(RecoveryStore::new(db))
}

fn print_status(store: &RecoveryStore) -> KbsResult<()> {
    let state = store.snapshot()?;
    let pin_type = match state.pin_type {
        Some(pin_type) => format!("{pin_type:?}").to_lowercase(),
        None => "none".to_string(),
    };

    println!("master key present:       {}", state.master_key.is_some());
    println!("master key backed up:     {}", state.is_master_key_backed_up);
    println!("pin type:                 {pin_type}");
    println!(
        "enclave:                  {}",
        state.enclave_name.as_deref().unwrap_or("none")
    );
    match KbsConfig::from_env() {
        Ok(config) => {
            println!("configured enclave:       {}", config.current_enclave);
            let needs_migration = state.is_master_key_backed_up
                && state.enclave_name.as_deref() != Some(config.current_enclave.name.as_str());
            println!("migration pending:        {needs_migration}");
        }
        Err(e) => tracing::warn!(error = %e, "Enclave configuration not loaded"),
    }
    println!("pending restoration:      {}", state.has_pending_restoration);
    println!(
        "backup request failed:    {}",
        state.has_backup_key_request_failed
    );
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let command = match parse_args() {
        Ok(command) => command,
        Err(message) => {
            eprintln!("{message}");
            print_help();
            return ExitCode::from(2);
        }
    };
    if let Command::Help = command {
        print_help();
        return ExitCode::SUCCESS;
    }

    init_tracing();

    let store = match open_state() {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "Failed to open key store");
            return ExitCode::FAILURE;
        }
    };

    match command {
        Command::Status => match print_status(&store) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read key state");
                ExitCode::FAILURE
            }
        },
        Command::VerifyPin(pin) => {
            let encoded = match store.read(|s| s.encoded_verification_string.clone()) {
                Ok(Some(encoded)) => encoded,
                Ok(None) => {
                    eprintln!("no verification string stored");
                    return ExitCode::FAILURE;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read key state");
                    return ExitCode::FAILURE;
                }
            };
            let verified =
                tokio::task::spawn_blocking(move || kdf::verify_pin(&pin, &encoded)).await;
            match verified {
                Ok(true) => {
                    println!("PIN matches");
                    ExitCode::SUCCESS
                }
                Ok(false) => {
                    println!("PIN does not match");
                    ExitCode::FAILURE
                }
                Err(e) => {
                    tracing::error!(error = %e, "PIN verification task failed");
                    ExitCode::FAILURE
                }
            }
        }
        Command::Help => ExitCode::SUCCESS,
    }
}
