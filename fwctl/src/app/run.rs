//! Command line front end

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use colored::Colorize;
use secrecy::SecretString;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::app::options::{AppOptions, Command, ConnectionOverrides, EngineOptions};
use crate::logs::{init_logging, LogOptions};
use crate::models::job::{AuthMode, JobKind, RemoteTarget};
use crate::storage::layout::StorageLayout;
use crate::storage::license::{assert_authorized, PlainDecoder};
use crate::storage::settings::{AuthKind, ConnectionSettings, Settings};
use crate::upgrade::diagnostics::TracingDiagnostics;
use crate::upgrade::engine::{
    CommandReport, ConnectionReport, JobHandle, JobNotice, UpgradeEngine, UpgradeRequest,
};
use crate::upgrade::launcher::{OutputStream, ProcessLauncher, TokioLauncher};
use crate::upgrade::pipeline::remote_join;
use crate::upgrade::report::JobReport;
use crate::upgrade::scripted::{ScriptedLauncher, ScriptedRun};
use crate::upgrade::transfer::local_checksum;

/// Environment variable holding the device password for `--auth=password`
pub const PASSWORD_ENV: &str = "FWCTL_PASSWORD";

/// Parse `--key=value` arguments into a map; bare `--flag`s map to `"true"`
pub fn parse_cli_args(args: impl IntoIterator<Item = String>) -> HashMap<String, String> {
    let mut cli_args = HashMap::new();
    for arg in args {
        if let Some((key, value)) = arg.split_once('=') {
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }
    cli_args
}

/// Build the application options from parsed arguments
pub fn parse_options(cli_args: &HashMap<String, String>) -> anyhow::Result<AppOptions> {
    let mut commands = Vec::new();
    if cli_args.contains_key("test-connection") {
        commands.push(Command::TestConnection);
    }
    if let Some(kind) = cli_args.get("upgrade") {
        let kind: JobKind = kind.parse().map_err(|e: String| anyhow!(e))?;
        if kind == JobKind::FileTransfer {
            bail!("Use --upload=<file> to transfer a file");
        }
        commands.push(Command::Upgrade(kind));
    }
    if let Some(file) = cli_args.get("upload") {
        commands.push(Command::Upload(PathBuf::from(file)));
    }
    if let Some(script) = cli_args.get("exec") {
        commands.push(Command::Exec(script.clone()));
    }
    let command = match commands.len() {
        0 => bail!("Nothing to do: pass --test-connection, --upgrade=<kind>, --upload=<file> or --exec=<command>"),
        1 => commands.remove(0),
        _ => bail!("Only one of --test-connection, --upgrade, --upload and --exec can be given"),
    };

    let port = cli_args
        .get("port")
        .map(|port| port.parse::<u16>().with_context(|| format!("Invalid port: {}", port)))
        .transpose()?;
    let auth = cli_args
        .get("auth")
        .map(|auth| auth.parse::<AuthKind>().map_err(|e| anyhow!(e)))
        .transpose()?;

    let layout = match cli_args.get("home") {
        Some(dir) => StorageLayout::new(dir),
        None => StorageLayout::default(),
    };

    Ok(AppOptions {
        command,
        layout,
        overrides: ConnectionOverrides {
            host: cli_args.get("host").cloned(),
            port,
            username: cli_args.get("user").cloned(),
            auth,
            remote_dir: cli_args.get("remote-dir").cloned(),
        },
        dry_run: cli_args.contains_key("dry-run"),
        save_settings: cli_args.contains_key("save-settings"),
    })
}

/// Build the device target from connection settings
pub fn remote_target(
    connection: &ConnectionSettings,
    password: Option<String>,
) -> anyhow::Result<RemoteTarget> {
    let auth = match connection.auth {
        AuthKind::Key => AuthMode::Key,
        AuthKind::Password => {
            let password = password
                .filter(|password| !password.is_empty())
                .ok_or_else(|| anyhow!("Password authentication needs {} to be set", PASSWORD_ENV))?;
            AuthMode::Password(SecretString::from(password))
        }
    };
    Ok(RemoteTarget::new(
        connection.host.clone(),
        connection.port,
        connection.username.clone(),
        auth,
    ))
}

/// Run the command described by `options`. Returns whether it succeeded.
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<bool> {
    let layout = &options.layout;
    layout
        .setup()
        .await
        .with_context(|| format!("Failed to create {}", layout.base_dir.display()))?;

    let settings_file = layout.settings_file();
    let mut settings = Settings::load(&settings_file)
        .await
        .with_context(|| format!("Unable to read {}", settings_file.path().display()))?;
    options.overrides.apply(&mut settings);

    let _log_guard = init_logging(LogOptions {
        log_level: settings.log_level,
        stdout: true,
        log_dir: Some(layout.logs_dir()),
        retention_days: settings.log_retention(),
        json_format: settings.log_json,
    })
    .context("Failed to initialize logging")?;

    if !options.overrides.is_empty() && (options.save_settings || settings.save_connection) {
        settings
            .save(&settings_file)
            .await
            .context("Failed to save settings")?;
        info!("Saved connection settings to {}", settings_file.path().display());
    }

    let authorization = assert_authorized(&layout.license_file(), &PlainDecoder)
        .await
        .context("This workstation is not licensed; send the output of --machine-code to obtain a key")?;

    let engine_options = EngineOptions::from_settings(&settings);
    let scripted = ScriptedLauncher::new();
    let launcher: Arc<dyn ProcessLauncher> = match options.dry_run {
        true => Arc::new(scripted.clone()),
        false => Arc::new(TokioLauncher),
    };
    let engine = UpgradeEngine::new(
        authorization,
        engine_options.clone(),
        launcher,
        Arc::new(TracingDiagnostics),
    );

    let target = remote_target(&settings.connection, std::env::var(PASSWORD_ENV).ok())?;

    let succeeded = match options.command {
        Command::TestConnection => {
            let report = engine.test_connection(&target).await?;
            print_connection_report(&target, &report);
            report.reachable
        }
        Command::Upgrade(kind) => {
            let handle = engine.start(UpgradeRequest::upgrade(kind, target)).await?;
            let report = follow(handle, shutdown_signal).await?;
            print_report(&report);
            report.succeeded()
        }
        Command::Exec(script) => {
            let report = exec(&engine, &target, &script, shutdown_signal).await?;
            print_command_report(&report);
            report.succeeded()
        }
        Command::Upload(path) => {
            if options.dry_run {
                prime_dry_run_upload(&scripted, &path, &engine_options.remote_dir).await?;
            }
            let handle = engine.start(UpgradeRequest::transfer(path, target)).await?;
            let report = follow(handle, shutdown_signal).await?;
            print_report(&report);
            report.succeeded()
        }
    };

    if options.dry_run {
        println!("\n{}", "Dry run, commands that would have been executed:".bold());
        for launch in scripted.launches() {
            println!("  {} {}", launch.program, launch.args.join(" "));
        }
    } else if !succeeded {
        let record = match settings.log_retention() {
            Some(_) => layout.logs_dir(),
            None => layout.diagnostics_log(),
        };
        println!("\nProcess output was recorded in {}", record.display());
    }

    Ok(succeeded)
}

/// Queue a successful upload and a matching checksum for a dry run
async fn prime_dry_run_upload(
    scripted: &ScriptedLauncher,
    path: &std::path::Path,
    remote_dir: &str,
) -> anyhow::Result<()> {
    let checksum = local_checksum(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    scripted.push(ScriptedRun::exits(0));
    scripted.push(ScriptedRun::exits(0).stdout(format!("{}  {}", checksum, remote_join(remote_dir, &name))));
    Ok(())
}

/// Print notices until the job ends; the shutdown signal cancels it
async fn follow(
    mut handle: JobHandle,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<JobReport> {
    tokio::pin!(shutdown_signal);
    let mut cancelled = false;

    loop {
        tokio::select! {
            notice = handle.next_notice() => match notice {
                Some(notice) => print_notice(&notice),
                None => break,
            },
            _ = &mut shutdown_signal, if !cancelled => {
                warn!("Interrupted, cancelling job {}", handle.id);
                handle.cancel();
                cancelled = true;
            }
        }
    }

    Ok(handle.wait().await?)
}

/// Run an operator command, printing its output as it arrives
async fn exec(
    engine: &UpgradeEngine,
    target: &RemoteTarget,
    script: &str,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<CommandReport> {
    println!("{} {}", "$".blue().bold(), script);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(notice) = rx.recv().await {
            print_notice(&notice);
        }
    });

    let report = tokio::select! {
        report = engine.run_command(target, script, tx) => report?,
        _ = shutdown_signal => {
            // dropping the command kills the ssh client
            printer.abort();
            bail!("Interrupted");
        }
    };
    if let Err(e) = printer.await {
        warn!("Output printer failed: {}", e);
    }
    Ok(report)
}

fn print_notice(notice: &JobNotice) {
    match notice {
        JobNotice::Phase(phase) => println!("{} {}", "==>".blue().bold(), phase),
        JobNotice::Progress { percent, label } => {
            println!("    {} {}", format!("{:>3}%", percent).cyan(), label)
        }
        JobNotice::Output(line) => match line.stream {
            OutputStream::Stdout => println!("    {}", line.text.dimmed()),
            OutputStream::Stderr => println!("    {}", line.text.yellow()),
        },
        JobNotice::Finished(_) => {}
    }
}

fn print_report(report: &JobReport) {
    println!();
    if report.succeeded() {
        let elapsed = report.elapsed().num_seconds();
        println!("{} {} finished in {}s", "OK".green().bold(), report.kind, elapsed);
        if let Some(checksum) = &report.remote_checksum {
            println!("   checksum {}", checksum);
        }
        return;
    }

    let category = report
        .category
        .map(|category| category.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!(
        "{} {} ended as {} [{}]",
        "FAILED".red().bold(),
        report.kind,
        report.phase,
        category
    );
    if let Some(line) = &report.diagnostic_line {
        println!("   cause: {}", line);
    }
    if let Some(code) = report.last_exit_code {
        println!("   exit code: {}", code);
    }
    if let (Some(local), Some(remote)) = (&report.local_checksum, &report.remote_checksum) {
        println!("   local checksum:  {}", local);
        println!("   remote checksum: {}", remote);
    }
    if let Some(remediation) = &report.remediation {
        println!("\n{}", remediation.yellow());
    }
}

fn print_command_report(report: &CommandReport) {
    let elapsed = report.elapsed.as_millis();
    let code = report
        .exit_code
        .map(|code| code.to_string())
        .unwrap_or_else(|| "none".to_string());
    match report.category {
        None => println!("{} exit code 0 after {}ms", "OK".green().bold(), elapsed),
        Some(category) => println!(
            "{} exit code {} after {}ms [{}]",
            "FAILED".red().bold(),
            code,
            elapsed,
            category
        ),
    }
}

fn print_connection_report(target: &RemoteTarget, report: &ConnectionReport) {
    if report.reachable {
        println!(
            "{} {} answered in {}ms",
            "OK".green().bold(),
            target.destination(),
            report.elapsed.as_millis()
        );
        return;
    }
    println!("{} cannot reach {}", "FAILED".red().bold(), target.destination());
    if let Some(detail) = &report.detail {
        println!("   cause: {}", detail);
    }
    if let Some(remediation) = &report.remediation {
        println!("\n{}", remediation.yellow());
    }
}
