// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! ICE candidates as exchanged between peers.
//!
//! The text form is the SDP `candidate` attribute value without the
//! `candidate:` prefix:
//! `<foundation> <component> <transport> <priority> <address> <port> typ <kind> [raddr <a> rport <p>] [tcptype <t>]`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CandidateParseError {
	#[error("candidate has too few fields")]
	TooShort,

	#[error("invalid {field}: {value}")]
	InvalidField { field: &'static str, value: String },

	#[error("missing 'typ' marker")]
	MissingType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateKind {
	Host,
	Srflx,
	Prflx,
	Relay,
}

impl CandidateKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			CandidateKind::Host => "host",
			CandidateKind::Srflx => "srflx",
			CandidateKind::Prflx => "prflx",
			CandidateKind::Relay => "relay",
		}
	}
}

impl fmt::Display for CandidateKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for CandidateKind {
	type Err = CandidateParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"host" => Ok(CandidateKind::Host),
			"srflx" => Ok(CandidateKind::Srflx),
			"prflx" => Ok(CandidateKind::Prflx),
			"relay" => Ok(CandidateKind::Relay),
			_ => Err(CandidateParseError::InvalidField {
				field: "candidate type",
				value: s.to_string(),
			}),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
	Udp4,
	Udp6,
	Tcp4,
	Tcp6,
}

impl NetworkType {
	fn from_transport(transport: &str, address: &str) -> Result<Self, CandidateParseError> {
		let v6 = address.contains(':');
		match (transport.to_ascii_lowercase().as_str(), v6) {
			("udp", false) => Ok(NetworkType::Udp4),
			("udp", true) => Ok(NetworkType::Udp6),
			("tcp", false) => Ok(NetworkType::Tcp4),
			("tcp", true) => Ok(NetworkType::Tcp6),
			_ => Err(CandidateParseError::InvalidField {
				field: "transport",
				value: transport.to_string(),
			}),
		}
	}

	pub fn transport(&self) -> &'static str {
		match self {
			NetworkType::Udp4 | NetworkType::Udp6 => "udp",
			NetworkType::Tcp4 | NetworkType::Tcp6 => "tcp",
		}
	}

	pub fn is_tcp(&self) -> bool {
		matches!(self, NetworkType::Tcp4 | NetworkType::Tcp6)
	}
}

impl fmt::Display for NetworkType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			NetworkType::Udp4 => "udp4",
			NetworkType::Udp6 => "udp6",
			NetworkType::Tcp4 => "tcp4",
			NetworkType::Tcp6 => "tcp6",
		})
	}
}

impl FromStr for NetworkType {
	type Err = CandidateParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"udp4" => Ok(NetworkType::Udp4),
			"udp6" => Ok(NetworkType::Udp6),
			"tcp4" => Ok(NetworkType::Tcp4),
			"tcp6" => Ok(NetworkType::Tcp6),
			_ => Err(CandidateParseError::InvalidField {
				field: "network type",
				value: s.to_string(),
			}),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TcpType {
	Active,
	Passive,
	So,
}

impl TcpType {
	pub fn as_str(&self) -> &'static str {
		match self {
			TcpType::Active => "active",
			TcpType::Passive => "passive",
			TcpType::So => "so",
		}
	}
}

impl FromStr for TcpType {
	type Err = CandidateParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"active" => Ok(TcpType::Active),
			"passive" => Ok(TcpType::Passive),
			"so" => Ok(TcpType::So),
			_ => Err(CandidateParseError::InvalidField {
				field: "tcptype",
				value: s.to_string(),
			}),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelatedAddress {
	pub address: String,
	pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
	pub kind: CandidateKind,
	pub foundation: String,
	pub component: u16,
	pub network_type: NetworkType,
	pub priority: u32,
	pub address: String,
	pub port: u16,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tcp_type: Option<TcpType>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub related_address: Option<RelatedAddress>,
}

impl Candidate {
	/// The transport address, if `address` is an IP literal.
	pub fn socket_addr(&self) -> Option<SocketAddr> {
		self.address
			.parse::<IpAddr>()
			.ok()
			.map(|ip| SocketAddr::new(ip, self.port))
	}

	pub fn is_relay(&self) -> bool {
		self.kind == CandidateKind::Relay
	}
}

impl fmt::Display for Candidate {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{} {} {} {} {} {} typ {}",
			self.foundation,
			self.component,
			self.network_type.transport(),
			self.priority,
			self.address,
			self.port,
			self.kind
		)?;
		if let Some(related) = &self.related_address {
			write!(f, " raddr {} rport {}", related.address, related.port)?;
		}
		if let Some(tcp_type) = self.tcp_type {
			write!(f, " tcptype {}", tcp_type.as_str())?;
		}
		Ok(())
	}
}

fn parse_field<T: FromStr>(field: &'static str, value: &str) -> Result<T, CandidateParseError> {
	value
		.parse()
		.map_err(|_| CandidateParseError::InvalidField {
			field,
			value: value.to_string(),
		})
}

impl FromStr for Candidate {
	type Err = CandidateParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		let s = s.strip_prefix("candidate:").unwrap_or(s);
		let fields: Vec<&str> = s.split_whitespace().collect();
		if fields.len() < 8 {
			return Err(CandidateParseError::TooShort);
		}
		if fields[6] != "typ" {
			return Err(CandidateParseError::MissingType);
		}

		let address = fields[4].to_string();
		let mut candidate = Candidate {
			foundation: fields[0].to_string(),
			component: parse_field("component", fields[1])?,
			network_type: NetworkType::from_transport(fields[2], &address)?,
			priority: parse_field("priority", fields[3])?,
			address,
			port: parse_field("port", fields[5])?,
			kind: fields[7].parse()?,
			tcp_type: None,
			related_address: None,
		};

		let mut raddr = None;
		let mut rport = None;
		for pair in fields[8..].chunks(2) {
			match pair {
				["raddr", value] => raddr = Some(value.to_string()),
				["rport", value] => rport = Some(parse_field::<u16>("rport", value)?),
				["tcptype", value] => candidate.tcp_type = Some(value.parse()?),
				// Unknown extension attributes are ignored.
				[_, _] => {}
				[name] => {
					return Err(CandidateParseError::InvalidField {
						field: "attribute",
						value: name.to_string(),
					})
				}
				_ => {}
			}
		}
		if let (Some(address), Some(port)) = (raddr, rport) {
			candidate.related_address = Some(RelatedAddress { address, port });
		}

		Ok(candidate)
	}
}
