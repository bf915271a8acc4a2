// SPDX-License-Identifier: Apache-2.0
// Copyright Flywall Authors

pub use clap::Parser;
use clap::Subcommand;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "flywall")]
#[command(version)]
#[command(about = "Declarative firewall, router and network services daemon", long_about = None)]
pub struct CmdArgs {
    #[command(subcommand)]
    pub command: Command,

    /// State directory (overrides FLYWALL_STATE_DIR).
    #[arg(long, env = "FLYWALL_STATE_DIR", default_value = "/var/lib/flywall")]
    pub state_dir: PathBuf,

    /// Runtime directory (overrides FLYWALL_RUN_DIR).
    #[arg(long, env = "FLYWALL_RUN_DIR", default_value = "/var/run/flywall")]
    pub run_dir: PathBuf,

    /// Control socket path (overrides FLYWALL_CTL_SOCKET).
    #[arg(long, env = "FLYWALL_CTL_SOCKET")]
    pub ctl_socket: Option<PathBuf>,
}

impl CmdArgs {
    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        self.ctl_socket
            .clone()
            .unwrap_or_else(|| self.run_dir.join("ctl.sock"))
    }

    #[must_use]
    pub fn pidfile(&self) -> PathBuf {
        self.run_dir.join("flywall.pid")
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the supervisor in the foreground.
    Start {
        /// Declarative configuration file.
        #[arg(short, long, value_name = "PATH")]
        config: PathBuf,
    },
    /// Validate a configuration file; exit 0 when clean.
    Check {
        path: PathBuf,
        /// Print every finding, not just the verdict.
        #[arg(short, long)]
        verbose: bool,
    },
    /// Compile a configuration and print the resulting ruleset.
    Show {
        path: PathBuf,
        /// Chain and rule counts instead of the full ruleset.
        #[arg(long)]
        summary: bool,
    },
    /// Signal the running supervisor to reload its configuration file.
    Reload,
    /// DHCP queries against the running supervisor.
    Dhcp {
        #[command(subcommand)]
        command: DhcpCommand,
    },
    /// VPN queries against the running supervisor.
    Vpn {
        #[command(subcommand)]
        command: VpnCommand,
    },
    /// WAN/uplink queries against the running supervisor.
    Wan {
        #[command(subcommand)]
        command: WanCommand,
    },
    /// Local user maintenance (offline store mutation).
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    /// Stage and finalize an in-place binary upgrade.
    Upgrade {
        /// Replace the currently installed binary.
        #[arg(long = "self")]
        self_update: bool,
        /// Image to install; stdin when omitted.
        #[arg(long, value_name = "PATH")]
        file: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum DhcpCommand {
    /// List active leases.
    Leases,
}

#[derive(Subcommand)]
pub enum VpnCommand {
    /// Tunnel and peer status.
    Status,
}

#[derive(Subcommand)]
pub enum WanCommand {
    /// Uplink group status.
    Status,
}

#[derive(Subcommand)]
pub enum UserCommand {
    /// Reset a user's password.
    ResetPassword {
        name: String,
        /// Read from this argument instead of prompting on stdin.
        #[arg(long)]
        password: Option<String>,
    },
}
