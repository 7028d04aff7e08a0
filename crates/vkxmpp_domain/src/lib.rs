#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Remote peer ids at or above this value address a multi-user chat.
pub const CHAT_PEER_OFFSET: i64 = 2_000_000_000;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid jid: {0}")]
	InvalidJid(String),
	#[error("invalid remote id: {0}")]
	InvalidRemoteId(String),
}

/// Split a JID into its bare part and optional resource.
pub fn split_jid(jid: &str) -> (&str, Option<&str>) {
	match jid.split_once('/') {
		Some((bare, resource)) if !resource.is_empty() => (bare, Some(resource)),
		Some((bare, _)) => (bare, None),
		None => (jid, None),
	}
}

/// Linked XMPP account, keyed by the owner's bare JID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct AccountId(String);

impl AccountId {
	/// Build from a bare or full JID; the resource is dropped and the JID lowercased.
	pub fn new(jid: impl AsRef<str>) -> Result<Self, ParseIdError> {
		let jid = jid.as_ref().trim();
		if jid.is_empty() {
			return Err(ParseIdError::Empty);
		}
		let (bare, _) = split_jid(jid);
		let Some((local, domain)) = bare.split_once('@') else {
			return Err(ParseIdError::InvalidJid(jid.to_string()));
		};
		if local.is_empty() || domain.is_empty() || domain.contains('@') {
			return Err(ParseIdError::InvalidJid(jid.to_string()));
		}
		Ok(Self(bare.to_ascii_lowercase()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	/// Local part of the JID (before `@`).
	pub fn local(&self) -> &str {
		self.0.split_once('@').map(|(l, _)| l).unwrap_or(&self.0)
	}

	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for AccountId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for AccountId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		AccountId::new(s)
	}
}

/// Remote-service user identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct RemoteId(pub i64);

impl RemoteId {
	pub const fn get(self) -> i64 {
		self.0
	}
}

impl fmt::Display for RemoteId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for RemoteId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		s.parse::<i64>()
			.map(RemoteId)
			.map_err(|_| ParseIdError::InvalidRemoteId(s.to_string()))
	}
}

/// Remote multi-user chat identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct ChatId(pub i64);

impl fmt::Display for ChatId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Addressee of a remote message: a single user or a multi-user chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Peer {
	User(RemoteId),
	Chat(ChatId),
}

impl Peer {
	/// Decode a raw long-poll peer id.
	pub fn from_raw(raw: i64) -> Self {
		if raw > CHAT_PEER_OFFSET {
			Peer::Chat(ChatId(raw - CHAT_PEER_OFFSET))
		} else {
			Peer::User(RemoteId(raw))
		}
	}
}

/// Maps remote ids onto JIDs under the gateway's domain and back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JidMap {
	gateway: String,
}

impl JidMap {
	pub fn new(gateway: impl Into<String>) -> Result<Self, ParseIdError> {
		let gateway = gateway.into().trim().to_ascii_lowercase();
		if gateway.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if gateway.contains('@') || gateway.contains('/') {
			return Err(ParseIdError::InvalidJid(gateway));
		}
		Ok(Self { gateway })
	}

	/// The gateway's own JID (a bare domain).
	pub fn gateway(&self) -> &str {
		&self.gateway
	}

	/// `123` → `123@gateway`.
	pub fn contact(&self, id: RemoteId) -> String {
		format!("{}@{}", id, self.gateway)
	}

	/// `123@gateway[/res]` → `123`. Returns `None` for foreign or non-numeric JIDs.
	pub fn remote_id(&self, jid: &str) -> Option<RemoteId> {
		let (bare, _) = split_jid(jid);
		let (local, domain) = bare.split_once('@')?;
		if !domain.eq_ignore_ascii_case(&self.gateway) {
			return None;
		}
		local.parse().ok()
	}

	pub fn is_gateway(&self, jid: &str) -> bool {
		split_jid(jid).0.eq_ignore_ascii_case(&self.gateway)
	}

	/// Whether the JID lives under the gateway domain (the gateway itself or one of its contacts).
	pub fn is_local(&self, jid: &str) -> bool {
		let (bare, _) = split_jid(jid);
		let domain = bare.rsplit_once('@').map(|(_, d)| d).unwrap_or(bare);
		domain.eq_ignore_ascii_case(&self.gateway)
	}
}

/// Bare JID of a bridged room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct RoomJid(String);

impl RoomJid {
	pub fn new(jid: impl AsRef<str>) -> Result<Self, ParseIdError> {
		let jid = jid.as_ref().trim();
		if jid.is_empty() {
			return Err(ParseIdError::Empty);
		}
		let (bare, _) = split_jid(jid);
		if !bare.contains('@') {
			return Err(ParseIdError::InvalidJid(jid.to_string()));
		}
		Ok(Self(bare.to_ascii_lowercase()))
	}

	/// Room JID for a remote chat owned by `account` on `conference_domain`.
	pub fn for_chat(chat: ChatId, account: &AccountId, conference_domain: &str) -> Self {
		let owner: String = account
			.local()
			.chars()
			.map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
			.collect();
		Self(format!("chat{}_{}@{}", chat.0, owner, conference_domain.to_ascii_lowercase()))
	}

	/// Remote chat id encoded in a room JID created by `for_chat`.
	pub fn chat_id(&self) -> Option<ChatId> {
		let local = self.0.split_once('@')?.0;
		let digits = local.strip_prefix("chat")?.split_once('_')?.0;
		digits.parse().ok().map(ChatId)
	}

	/// `room@conference/nick`
	pub fn occupant(&self, nick: &str) -> String {
		format!("{}/{}", self.0, nick)
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for RoomJid {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn account_id_drops_resource_and_lowercases() {
		let id = AccountId::new("Alice@Example.org/phone").unwrap();
		assert_eq!(id.as_str(), "alice@example.org");
		assert_eq!(id.local(), "alice");
	}

	#[test]
	fn rejects_malformed_accounts() {
		assert!(AccountId::new("").is_err());
		assert!(AccountId::new("example.org").is_err());
		assert!(AccountId::new("@example.org").is_err());
	}

	#[test]
	fn jid_map_roundtrip() {
		let map = JidMap::new("vk.example.org").unwrap();
		let jid = map.contact(RemoteId(42));
		assert_eq!(jid, "42@vk.example.org");
		assert_eq!(map.remote_id(&jid), Some(RemoteId(42)));
		assert_eq!(map.remote_id("42@vk.example.org/res"), Some(RemoteId(42)));
		assert_eq!(map.remote_id("42@other.org"), None);
		assert_eq!(map.remote_id("vk.example.org"), None);
		assert!(map.is_gateway("vk.example.org/bridge"));
		assert!(map.is_local("7@vk.example.org"));
		assert!(!map.is_local("alice@example.org"));
	}

	#[test]
	fn peer_splits_chats_from_users() {
		assert_eq!(Peer::from_raw(15), Peer::User(RemoteId(15)));
		assert_eq!(Peer::from_raw(CHAT_PEER_OFFSET + 7), Peer::Chat(ChatId(7)));
	}

	#[test]
	fn room_jid_encodes_chat_id() {
		let account = AccountId::new("john.doe@example.org").unwrap();
		let room = RoomJid::for_chat(ChatId(12), &account, "conference.example.org");
		assert_eq!(room.as_str(), "chat12_john_doe@conference.example.org");
		assert_eq!(room.chat_id(), Some(ChatId(12)));
		assert_eq!(room.occupant("bot"), "chat12_john_doe@conference.example.org/bot");
	}
}
