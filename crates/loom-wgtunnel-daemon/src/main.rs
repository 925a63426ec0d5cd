// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! `loom-wgtunnel` binary.

use anyhow::Context;
use clap::{Parser, Subcommand};
use loom_wgtunnel_common::WgPrivateKey;
use loom_wgtunnel_daemon::{ConfigLoader, Daemon, LogFormat, SYSTEM_CONFIG_PATH};
use loom_wgtunnel_epdisc::WgCommandDevice;
use loom_wgtunnel_signaling::BackendRegistry;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// WireGuard endpoint discovery daemon.
#[derive(Parser, Debug)]
#[command(name = "loom-wgtunnel", about = "WireGuard endpoint discovery daemon", version)]
struct Cli {
	/// Configuration file
	#[arg(long, short, env = "LOOM_WG_CONFIG", default_value = SYSTEM_CONFIG_PATH)]
	config: PathBuf,

	/// Overrides `log.format` from the configuration
	#[arg(long, value_enum)]
	log_format: Option<LogFormat>,

	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Run the daemon (default)
	Daemon,
	/// Print a new private key
	Genkey,
	/// Read a private key on stdin and print its public key
	Pubkey,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();

	match cli.command.unwrap_or(Command::Daemon) {
		Command::Genkey => {
			let key = WgPrivateKey::generate();
			println!("{}", key.to_base64().as_str());
			Ok(())
		}
		Command::Pubkey => {
			let mut input = String::new();
			tokio::io::stdin()
				.read_to_string(&mut input)
				.await
				.context("failed to read private key from stdin")?;
			let key = WgPrivateKey::from_base64(input.trim()).context("invalid private key")?;
			println!("{}", key.public_key());
			Ok(())
		}
		Command::Daemon => run_daemon(cli.config, cli.log_format).await,
	}
}

async fn run_daemon(path: PathBuf, log_format: Option<LogFormat>) -> anyhow::Result<()> {
	let loader = ConfigLoader::new(Some(path));
	let config = loader.load().context("failed to load configuration")?;

	let format = log_format.unwrap_or(config.log.format);
	let json = format == LogFormat::Json;
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| config.log.level.clone().into()),
		)
		.with(json.then(|| tracing_subscriber::fmt::layer().json()))
		.with((!json).then(tracing_subscriber::fmt::layer))
		.init();

	tracing::info!(
		config = ?loader.path(),
		backends = ?config.backends,
		"starting loom-wgtunnel"
	);

	let registry = BackendRegistry::with_defaults();
	let device = Arc::new(WgCommandDevice::default());
	let daemon = match Daemon::new(config, &registry, device).await {
		Ok(daemon) => daemon.with_loader(loader),
		Err(e) => {
			tracing::error!(error = %e, "failed to start daemon");
			return Err(e.into());
		}
	};

	daemon.run().await?;
	Ok(())
}
