//! fwctl - Entry Point
//!
//! Field upgrade tool for embedded imaging devices. Uploads packages over scp and drives the
//! remote software, firmware and module upgrade procedures over ssh.

use std::env;
use std::process::ExitCode;

use fwctl::app::run::{parse_cli_args, parse_options, run};
use fwctl::storage::license::machine_code;
use fwctl::utils::version_info;

use tracing::info;

#[tokio::main]
async fn main() -> ExitCode {
    let cli_args = parse_cli_args(env::args().skip(1));

    // Print version and exit
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version_info()) {
            Ok(version) => println!("{}", version),
            Err(e) => eprintln!("Failed to render version: {}", e),
        }
        return ExitCode::SUCCESS;
    }

    // Print the code a license key is issued for
    if cli_args.contains_key("machine-code") {
        println!("{}", machine_code());
        return ExitCode::SUCCESS;
    }

    let options = match parse_options(&cli_args) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{e}");
            eprintln!(
                "Usage: fwctl (--test-connection | --upgrade=software|firmware|module | --upload=<file>\n\
                 \x20             | --exec=<command>)\n\
                 \x20            [--host=<ip>] [--port=<port>] [--user=<name>] [--auth=key|password]\n\
                 \x20            [--remote-dir=<dir>] [--home=<dir>] [--save-settings] [--dry-run]\n\
                 \x20      fwctl --machine-code | --version"
            );
            return ExitCode::from(2);
        }
    };

    match run(options, await_shutdown_signal()).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("SIGTERM received, cancelling...");
                    }
                    _ = sigint.recv() => {
                        info!("SIGINT received, cancelling...");
                    }
                }
                return;
            }
            _ => {
                info!("Unix signal handlers unavailable, falling back to Ctrl+C");
            }
        }
    }

    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Ctrl+C received, cancelling...");
    } else {
        std::future::pending::<()>().await;
    }
}
