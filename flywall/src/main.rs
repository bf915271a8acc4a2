// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

mod args;
mod trace;

use args::{CmdArgs, Command, DhcpCommand, Parser, UserCommand, VpnCommand, WanCommand};
use mgmt::{RpcClient, Supervisor, SupervisorOptions};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

const EXIT_OK: u8 = 0;
const EXIT_VALIDATION: u8 = 1;
const EXIT_IO: u8 = 2;
const EXIT_RUNNING: u8 = 3;
const EXIT_DENIED: u8 = 4;

fn main() -> ExitCode {
    let args = CmdArgs::parse();
    if trace::init().is_err() {
        eprintln!("cannot open log file");
        return ExitCode::from(EXIT_IO);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("runtime: {error}");
            return ExitCode::from(EXIT_IO);
        }
    };
    let code = runtime.block_on(run(args));
    ExitCode::from(code)
}

async fn run(args: CmdArgs) -> u8 {
    match &args.command {
        Command::Check { path, verbose } => check(path, *verbose),
        Command::Show { path, summary } => show(path, *summary),
        Command::Start { config } => start(&args, config.clone()).await,
        Command::Reload => reload(&args),
        Command::Dhcp { command: DhcpCommand::Leases } => {
            query(&args, "GetLeases", Value::Null).await
        }
        Command::Vpn { command: VpnCommand::Status } => {
            query(&args, "VpnStatus", Value::Null).await
        }
        Command::Wan { command: WanCommand::Status } => {
            query(&args, "GetUplinks", Value::Null).await
        }
        Command::User {
            command: UserCommand::ResetPassword { name, password },
        } => reset_password(&args, name, password.as_deref()),
        Command::Upgrade { self_update, file } => {
            if !self_update {
                eprintln!("only --self upgrades are supported");
                return EXIT_VALIDATION;
            }
            upgrade(&args, file.as_deref()).await
        }
    }
}

fn load_valid(path: &Path) -> Result<config::ValidModel, u8> {
    let model = match config::from_yaml_file(path) {
        Ok(model) => model,
        Err(config::frontend::FrontendError::Read { path, source }) => {
            eprintln!("cannot read {path}: {source}");
            return Err(EXIT_IO);
        }
        Err(error) => {
            eprintln!("{error}");
            return Err(EXIT_VALIDATION);
        }
    };
    config::validate(model).map_err(|errors| {
        eprintln!("{errors}");
        EXIT_VALIDATION
    })
}

fn check(path: &Path, verbose: bool) -> u8 {
    match load_valid(path) {
        Ok(valid) => {
            if verbose {
                println!(
                    "ok: {} interfaces, {} zones, {} policies, {} nat rules",
                    valid.model().interfaces.len(),
                    valid.zones().len(),
                    valid.model().policies.len(),
                    valid.model().nat.len(),
                );
            } else {
                println!("ok");
            }
            EXIT_OK
        }
        Err(code) => code,
    }
}

fn show(path: &Path, summary: bool) -> u8 {
    let valid = match load_valid(path) {
        Ok(valid) => valid,
        Err(code) => return code,
    };
    match firewall::compile(&valid) {
        Ok(ruleset) => {
            if summary {
                print!("{}", firewall::render::summary(&ruleset));
            } else {
                print!("{}", firewall::render::nft(&ruleset));
            }
            EXIT_OK
        }
        Err(error) => {
            eprintln!("{error}");
            EXIT_VALIDATION
        }
    }
}

/// A stale pidfile (dead process) is reclaimed; a live one means exit 3.
fn acquire_pidfile(path: &Path) -> Result<(), u8> {
    if let Ok(text) = std::fs::read_to_string(path) {
        if let Ok(pid) = text.trim().parse::<i32>() {
            let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok();
            if alive {
                eprintln!("flywall already running (pid {pid})");
                return Err(EXIT_RUNNING);
            }
        }
    }
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    std::fs::write(path, format!("{}\n", std::process::id())).map_err(|error| {
        eprintln!("pidfile: {error}");
        EXIT_IO
    })
}

async fn start(args: &CmdArgs, config_path: std::path::PathBuf) -> u8 {
    if let Err(code) = acquire_pidfile(&args.pidfile()) {
        return code;
    }

    let options = SupervisorOptions {
        state_dir: args.state_dir.clone(),
        run_dir: args.run_dir.clone(),
        socket_path: args.socket_path(),
        config_path: Some(config_path),
        kernel: true,
        services: true,
        shutdown_grace: std::time::Duration::from_secs(5),
    };
    let supervisor = match Supervisor::new(options) {
        Ok(supervisor) => supervisor,
        Err(error) => {
            error!(%error, "supervisor start failed");
            let _ = std::fs::remove_file(args.pidfile());
            return match error.kind() {
                "auth" => EXIT_DENIED,
                _ => EXIT_IO,
            };
        }
    };

    info!("flywall starting");
    if let Err(error) = supervisor.reload_from_file().await {
        error!(%error, "initial configuration rejected");
        let _ = std::fs::remove_file(args.pidfile());
        return match error.kind() {
            "validation" => EXIT_VALIDATION,
            "auth" => EXIT_DENIED,
            _ => EXIT_IO,
        };
    }

    tokio::spawn(mgmt::server::serve(Arc::clone(&supervisor)));

    if std::env::var("FLYWALL_SKIP_API").is_err() {
        let api_config = supervisor.applied_api_config();
        match api_config.listen.parse() {
            Ok(listen) => {
                if std::env::var("FLYWALL_NO_SANDBOX").is_ok() {
                    warn!("FLYWALL_NO_SANDBOX set: api runs without privilege separation");
                }
                let server = api::ApiServer::new(
                    args.socket_path(),
                    listen,
                    api_config.session_secret.as_deref(),
                    api_config.api_keys.clone(),
                );
                tokio::spawn(server.run(supervisor.shutdown_signal()));
            }
            Err(error) => warn!(%error, "api listen address invalid, api disabled"),
        }
    }

    // Blocks until SIGTERM finishes the graceful shutdown.
    let result = Arc::clone(&supervisor).run_signals().await;
    let _ = std::fs::remove_file(args.pidfile());
    match result {
        Ok(()) => {
            info!("flywall stopped");
            EXIT_OK
        }
        Err(error) => {
            error!(%error, "signal loop failed");
            EXIT_IO
        }
    }
}

fn reload(args: &CmdArgs) -> u8 {
    let text = match std::fs::read_to_string(args.pidfile()) {
        Ok(text) => text,
        Err(_) => {
            eprintln!("no running supervisor (pidfile absent)");
            return EXIT_IO;
        }
    };
    let Ok(pid) = text.trim().parse::<i32>() else {
        eprintln!("malformed pidfile");
        return EXIT_IO;
    };
    match nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid),
        nix::sys::signal::Signal::SIGHUP,
    ) {
        Ok(()) => EXIT_OK,
        Err(nix::errno::Errno::EPERM) => {
            eprintln!("permission denied signalling pid {pid}");
            EXIT_DENIED
        }
        Err(error) => {
            eprintln!("signal failed: {error}");
            EXIT_IO
        }
    }
}

async fn query(args: &CmdArgs, method: &str, params: Value) -> u8 {
    let mut client = match RpcClient::connect(&args.socket_path()).await {
        Ok(client) => client,
        Err(error) => {
            eprintln!("cannot reach supervisor: {error}");
            return EXIT_IO;
        }
    };
    match client.call(method, params).await {
        Ok(result) => {
            match serde_json::to_string_pretty(&result) {
                Ok(pretty) => println!("{pretty}"),
                Err(_) => println!("{result}"),
            }
            EXIT_OK
        }
        Err(mgmt::RpcError::Remote { kind, message }) => {
            eprintln!("{kind}: {message}");
            match kind.as_str() {
                "validation" => EXIT_VALIDATION,
                "auth" => EXIT_DENIED,
                _ => EXIT_IO,
            }
        }
        Err(error) => {
            eprintln!("{error}");
            EXIT_IO
        }
    }
}

fn reset_password(args: &CmdArgs, user: &str, password: Option<&str>) -> u8 {
    let password = match password {
        Some(password) => password.to_string(),
        None => {
            eprint!("new password for {user}: ");
            let mut line = String::new();
            if std::io::stdin().read_line(&mut line).is_err() {
                return EXIT_IO;
            }
            line.trim_end().to_string()
        }
    };
    // Offline mutation: open the store directly; refuses while the daemon
    // holds the lock.
    let supervisor = match Supervisor::new(SupervisorOptions::headless(args.state_dir.clone())) {
        Ok(supervisor) => supervisor,
        Err(error) => {
            eprintln!("state store unavailable (daemon running?): {error}");
            return EXIT_IO;
        }
    };
    match supervisor.reset_password(user, &password) {
        Ok(()) => {
            println!("password updated for {user}");
            EXIT_OK
        }
        Err(error) => {
            eprintln!("{error}");
            EXIT_IO
        }
    }
}

async fn upgrade(args: &CmdArgs, file: Option<&Path>) -> u8 {
    let bytes = match file {
        Some(path) => match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(error) => {
                eprintln!("cannot read {}: {error}", path.display());
                return EXIT_IO;
            }
        },
        None => {
            let mut bytes = Vec::new();
            if std::io::stdin().read_to_end(&mut bytes).is_err() {
                return EXIT_IO;
            }
            bytes
        }
    };
    let sha256 = format!("{:x}", Sha256::digest(&bytes));
    use base64::Engine as _;
    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);

    let mut client = match RpcClient::connect(&args.socket_path()).await {
        Ok(client) => client,
        Err(error) => {
            eprintln!("cannot reach supervisor: {error}");
            return EXIT_IO;
        }
    };
    if let Err(error) = client
        .call("StageBinary", json!({ "bytes": encoded, "sha256": sha256 }))
        .await
    {
        eprintln!("stage failed: {error}");
        return EXIT_IO;
    }
    match client.call("Upgrade", json!({ "sha256": sha256 })).await {
        Ok(result) => {
            println!("upgraded: {}", result["path"]);
            EXIT_OK
        }
        Err(error) => {
            eprintln!("upgrade failed: {error}");
            EXIT_IO
        }
    }
}
