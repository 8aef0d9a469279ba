// Mesh VPN admission hook

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mesh_admission::{
    config::load_config,
    hooks::{self, Clock},
    store::BlacklistStore,
    types::{Config, ConnectionAttempt, InterfaceName, PeerKey},
};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "mesh-admission")]
#[command(about = "Admission control hooks for a mesh VPN daemon", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/mesh-admission/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decide whether a peer may connect (exit 0 = accept, 1 = deny)
    Verify {
        /// Public key of the connecting peer
        #[arg(long, env = "PEER_KEY")]
        peer_key: PeerKey,
        /// Mesh VPN interface the peer connects on
        #[arg(long, env = "INTERFACE")]
        interface: InterfaceName,
    },

    /// Run onboarding for an established connection
    Establish {
        /// Public key of the connected peer
        #[arg(long, env = "PEER_KEY")]
        peer_key: PeerKey,
        /// Mesh VPN interface the peer is connected on
        #[arg(long, env = "INTERFACE")]
        interface: InterfaceName,
        /// Process id of the VPN daemon
        #[arg(long, env = "FASTD_PID")]
        daemon_pid: u32,
        /// MTU of the interface
        #[arg(long, env = "INTERFACE_MTU", default_value_t = 1406)]
        mtu: u32,
        /// Remote address of the peer
        #[arg(long, env = "PEER_ADDRESS", default_value = "")]
        remote_address: String,
    },

    /// Inspect or edit the blacklist
    Blacklist {
        #[command(subcommand)]
        action: BlacklistAction,
    },

    /// Show whether an onboarding run is active on an interface
    Status {
        interface: InterfaceName,
    },
}

#[derive(Subcommand)]
enum BlacklistAction {
    /// Block a peer starting now
    Add { peer_key: PeerKey },
    /// Show when a peer was blocked and how long the block lasts
    Show { peer_key: PeerKey },
    /// Unblock a peer
    Remove { peer_key: PeerKey },
}

fn main() -> ExitCode {
    // Hooks are short-lived; a single-threaded runtime is enough
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .enable_io()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(async_main()) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            log::error!("{:#}", e);
            eprintln!("mesh-admission: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn async_main() -> Result<u8> {
    let args = Args::parse();

    let config = load_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    // Initialize logging (stderr is captured by the daemon)
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.general.log_level),
    )
    .init();

    let clock = Clock::now();

    let code = match args.command {
        Command::Verify {
            peer_key,
            interface,
        } => hooks::run_verify(&config, &peer_key, &interface, clock),

        Command::Establish {
            peer_key,
            interface,
            daemon_pid,
            mtu,
            remote_address,
        } => {
            let attempt = ConnectionAttempt {
                peer_key,
                interface,
                remote_address,
                daemon_pid,
                mtu,
            };
            hooks::run_establish(&config, &attempt, clock).await
        }

        Command::Blacklist { action } => blacklist(&config, action, clock)?,

        Command::Status { interface } => {
            println!("{}", hooks::run_status(&config, &interface));
            0
        }
    };

    Ok(u8::try_from(code).unwrap_or(1))
}

fn blacklist(config: &Config, action: BlacklistAction, clock: Clock) -> Result<i32> {
    let store = hooks::file_store(config);

    match action {
        BlacklistAction::Add { peer_key } => {
            store.put(&peer_key, clock.unix)?;
            log::info!("Blacklisted {} at {}", peer_key, clock.unix);
        }
        BlacklistAction::Show { peer_key } => match store.get(&peer_key)? {
            Some(blocked_at) => {
                let age = clock.unix.saturating_sub(blocked_at);
                let remaining = config.blacklist.ttl.saturating_sub(age);
                println!(
                    "{}: blocked at {} ({}s ago, {}s remaining)",
                    peer_key, blocked_at, age, remaining
                );
            }
            None => println!("{}: not blacklisted", peer_key),
        },
        BlacklistAction::Remove { peer_key } => {
            store.delete(&peer_key)?;
            log::info!("Removed {} from blacklist", peer_key);
        }
    }

    Ok(0)
}
