// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! [`WireGuardDevice`] that drives the `wg` tool.

use crate::device::{Device, DevicePeer, DeviceUpdate, WireGuardDevice};
use crate::error::DeviceError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use loom_wgtunnel_common::{WgPrivateKey, WgPublicKey};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

const NONE: &str = "(none)";

#[derive(Debug, Clone)]
pub struct WgCommandDevice {
	binary: PathBuf,
}

impl Default for WgCommandDevice {
	fn default() -> Self {
		Self::new("wg")
	}
}

impl WgCommandDevice {
	pub fn new(binary: impl Into<PathBuf>) -> Self {
		Self {
			binary: binary.into(),
		}
	}

	async fn run(&self, args: &[String], stdin: Option<&[u8]>) -> Result<String, DeviceError> {
		let mut command = Command::new(&self.binary);
		command
			.args(args)
			.stdin(if stdin.is_some() {
				Stdio::piped()
			} else {
				Stdio::null()
			})
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.kill_on_drop(true);

		let mut child = command.spawn()?;
		if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
			pipe.write_all(input).await?;
			pipe.shutdown().await?;
		}
		let output = child.wait_with_output().await?;
		if !output.status.success() {
			return Err(DeviceError::Command {
				command: format!("{} {}", self.binary.display(), args.join(" ")),
				status: output.status.to_string(),
				stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
			});
		}
		String::from_utf8(output.stdout).map_err(|e| DeviceError::Parse(e.to_string()))
	}
}

fn optional(field: &str) -> Option<&str> {
	match field {
		NONE | "" | "off" | "0" => None,
		other => Some(other),
	}
}

fn parse_handshake(field: &str) -> Result<Option<DateTime<Utc>>, DeviceError> {
	let secs: i64 = field
		.parse()
		.map_err(|_| DeviceError::Parse(format!("invalid handshake time: {}", field)))?;
	if secs == 0 {
		return Ok(None);
	}
	Ok(DateTime::from_timestamp(secs, 0))
}

fn parse_peer(line: &str) -> Result<DevicePeer, DeviceError> {
	let fields: Vec<&str> = line.split('\t').collect();
	if fields.len() < 8 {
		return Err(DeviceError::Parse(format!("short peer line: {}", line)));
	}
	let public_key =
		WgPublicKey::from_base64(fields[0]).map_err(|e| DeviceError::Parse(e.to_string()))?;
	let endpoint = optional(fields[2])
		.map(|e| e.parse::<SocketAddr>())
		.transpose()
		.map_err(|_| DeviceError::Parse(format!("invalid endpoint: {}", fields[2])))?;
	let allowed_ips = match optional(fields[3]) {
		None => Vec::new(),
		Some(list) => list
			.split(',')
			.map(|net| net.trim().parse::<IpNet>())
			.collect::<Result<Vec<_>, _>>()
			.map_err(|_| DeviceError::Parse(format!("invalid allowed-ips: {}", fields[3])))?,
	};
	let persistent_keepalive = optional(fields[7])
		.map(|k| k.parse::<u16>())
		.transpose()
		.map_err(|_| DeviceError::Parse(format!("invalid keepalive: {}", fields[7])))?;

	Ok(DevicePeer {
		public_key,
		endpoint,
		allowed_ips,
		persistent_keepalive,
		last_handshake: parse_handshake(fields[4])?,
	})
}

/// Parses `wg show <interface> dump`.
pub fn parse_dump(name: &str, dump: &str) -> Result<Device, DeviceError> {
	let mut lines = dump.lines().filter(|l| !l.trim().is_empty());
	let header = lines
		.next()
		.ok_or_else(|| DeviceError::Parse("empty dump".to_string()))?;
	let fields: Vec<&str> = header.split('\t').collect();
	if fields.len() < 3 {
		return Err(DeviceError::Parse(format!("short interface line: {}", header)));
	}

	let private_key = optional(fields[0])
		.map(WgPrivateKey::from_base64)
		.transpose()
		.map_err(|e| DeviceError::Parse(e.to_string()))?;
	let public_key = optional(fields[1])
		.map(WgPublicKey::from_base64)
		.transpose()
		.map_err(|e| DeviceError::Parse(e.to_string()))?;
	let listen_port = optional(fields[2])
		.map(|p| p.parse::<u16>())
		.transpose()
		.map_err(|_| DeviceError::Parse(format!("invalid listen port: {}", fields[2])))?;
	let peers = lines.map(parse_peer).collect::<Result<Vec<_>, _>>()?;

	Ok(Device {
		name: name.to_string(),
		private_key,
		public_key,
		listen_port,
		peers,
	})
}

/// Arguments for `wg set`. A private key is read from stdin.
pub fn set_args(name: &str, update: &DeviceUpdate) -> Vec<String> {
	let mut args = vec!["set".to_string(), name.to_string()];
	if let Some(port) = update.listen_port {
		args.push("listen-port".to_string());
		args.push(port.to_string());
	}
	if update.private_key.is_some() {
		args.push("private-key".to_string());
		args.push("/dev/stdin".to_string());
	}
	for peer in &update.peers {
		args.push("peer".to_string());
		args.push(peer.public_key.to_base64());
		if peer.remove {
			args.push("remove".to_string());
			continue;
		}
		if let Some(endpoint) = peer.endpoint {
			args.push("endpoint".to_string());
			args.push(endpoint.to_string());
		}
		if let Some(allowed_ips) = &peer.allowed_ips {
			args.push("allowed-ips".to_string());
			args.push(
				allowed_ips
					.iter()
					.map(|net| net.to_string())
					.collect::<Vec<_>>()
					.join(","),
			);
		}
		if let Some(keepalive) = peer.persistent_keepalive {
			args.push("persistent-keepalive".to_string());
			args.push(if keepalive == 0 {
				"off".to_string()
			} else {
				keepalive.to_string()
			});
		}
	}
	args
}

#[async_trait]
impl WireGuardDevice for WgCommandDevice {
	async fn list(&self) -> Result<Vec<String>, DeviceError> {
		let output = self
			.run(&["show".to_string(), "interfaces".to_string()], None)
			.await?;
		Ok(output.split_whitespace().map(str::to_string).collect())
	}

	#[instrument(skip(self))]
	async fn get(&self, name: &str) -> Result<Device, DeviceError> {
		let args = ["show".to_string(), name.to_string(), "dump".to_string()];
		match self.run(&args, None).await {
			Ok(dump) => parse_dump(name, &dump),
			Err(DeviceError::Command { stderr, .. }) if stderr.contains("No such device") => {
				Err(DeviceError::NotFound(name.to_string()))
			}
			Err(e) => Err(e),
		}
	}

	#[instrument(skip(self, update), fields(peers = update.peers.len()))]
	async fn set(&self, name: &str, update: DeviceUpdate) -> Result<(), DeviceError> {
		if update.is_empty() {
			return Ok(());
		}
		let args = set_args(name, &update);
		let key = update.private_key.as_ref().map(|k| k.to_base64());
		debug!(interface = name, "applying device update");
		self.run(&args, key.as_ref().map(|k| k.as_bytes())).await?;
		Ok(())
	}
}
