#![forbid(unsafe_code)]

pub mod caps;
pub mod component;
pub mod framer;
pub mod stanza;

use thiserror::Error;

pub const NS_COMPONENT: &str = "jabber:component:accept";
pub const NS_STREAM: &str = "http://etherx.jabber.org/streams";
pub const NS_CAPS: &str = "http://jabber.org/protocol/caps";
pub const NS_NICK: &str = "http://jabber.org/protocol/nick";
pub const NS_CHATSTATES: &str = "http://jabber.org/protocol/chatstates";
pub const NS_DELAY: &str = "urn:xmpp:delay";
pub const NS_DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
pub const NS_MUC: &str = "http://jabber.org/protocol/muc";
pub const NS_MUC_USER: &str = "http://jabber.org/protocol/muc#user";
pub const NS_MUC_ADMIN: &str = "http://jabber.org/protocol/muc#admin";
pub const NS_MUC_OWNER: &str = "http://jabber.org/protocol/muc#owner";
pub const NS_DATA_FORMS: &str = "jabber:x:data";
pub const NS_STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceType {
	Available,
	Unavailable,
	Subscribe,
	Subscribed,
	Unsubscribe,
	Unsubscribed,
	Probe,
	Error,
}

impl PresenceType {
	/// Value of the `type` attribute; `None` for plain availability.
	pub fn as_attr(self) -> Option<&'static str> {
		match self {
			Self::Available => None,
			Self::Unavailable => Some("unavailable"),
			Self::Subscribe => Some("subscribe"),
			Self::Subscribed => Some("subscribed"),
			Self::Unsubscribe => Some("unsubscribe"),
			Self::Unsubscribed => Some("unsubscribed"),
			Self::Probe => Some("probe"),
			Self::Error => Some("error"),
		}
	}

	pub fn from_attr(attr: Option<&str>) -> Option<Self> {
		Some(match attr {
			None | Some("") => Self::Available,
			Some("unavailable") => Self::Unavailable,
			Some("subscribe") => Self::Subscribe,
			Some("subscribed") => Self::Subscribed,
			Some("unsubscribe") => Self::Unsubscribe,
			Some("unsubscribed") => Self::Unsubscribed,
			Some("probe") => Self::Probe,
			Some("error") => Self::Error,
			Some(_) => return None,
		})
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
	Chat,
	Groupchat,
	Normal,
	Error,
}

impl MessageType {
	pub fn as_attr(self) -> &'static str {
		match self {
			Self::Chat => "chat",
			Self::Groupchat => "groupchat",
			Self::Normal => "normal",
			Self::Error => "error",
		}
	}

	pub fn from_attr(attr: Option<&str>) -> Self {
		match attr {
			Some("chat") => Self::Chat,
			Some("groupchat") => Self::Groupchat,
			Some("error") => Self::Error,
			_ => Self::Normal,
		}
	}
}

/// XEP-0085 chat states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatState {
	Active,
	Composing,
	Paused,
}

impl ChatState {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Active => "active",
			Self::Composing => "composing",
			Self::Paused => "paused",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
	pub from: String,
	pub to: String,
	pub kind: PresenceType,
	pub nick: Option<String>,
	/// Entity-capabilities verification string.
	pub caps: Option<String>,
	pub status: Option<String>,
	/// Carry an empty MUC `<x/>` (room join).
	pub muc_join: bool,
}

impl Presence {
	pub fn new(from: impl Into<String>, to: impl Into<String>, kind: PresenceType) -> Self {
		Self {
			from: from.into(),
			to: to.into(),
			kind,
			nick: None,
			caps: None,
			status: None,
			muc_join: false,
		}
	}

	pub fn with_nick(mut self, nick: impl Into<String>) -> Self {
		self.nick = Some(nick.into());
		self
	}

	pub fn with_caps(mut self, ver: impl Into<String>) -> Self {
		self.caps = Some(ver.into());
		self
	}

	pub fn with_status(mut self, status: impl Into<String>) -> Self {
		self.status = Some(status.into());
		self
	}

	pub fn joining_room(mut self) -> Self {
		self.muc_join = true;
		self
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
	pub from: String,
	pub to: String,
	pub kind: MessageType,
	pub body: Option<String>,
	/// Unix seconds, rendered as a delay stamp.
	pub timestamp: Option<i64>,
	pub chat_state: Option<ChatState>,
}

impl Message {
	pub fn chat(from: impl Into<String>, to: impl Into<String>, body: impl Into<String>) -> Self {
		Self {
			from: from.into(),
			to: to.into(),
			kind: MessageType::Chat,
			body: Some(body.into()),
			timestamp: None,
			chat_state: Some(ChatState::Active),
		}
	}

	pub fn groupchat(from: impl Into<String>, to: impl Into<String>, body: impl Into<String>) -> Self {
		Self {
			from: from.into(),
			to: to.into(),
			kind: MessageType::Groupchat,
			body: Some(body.into()),
			timestamp: None,
			chat_state: None,
		}
	}

	/// Body-less chat-state notification.
	pub fn chat_state(from: impl Into<String>, to: impl Into<String>, state: ChatState) -> Self {
		Self {
			from: from.into(),
			to: to.into(),
			kind: MessageType::Chat,
			body: None,
			timestamp: None,
			chat_state: Some(state),
		}
	}

	pub fn with_timestamp(mut self, ts: i64) -> Self {
		self.timestamp = Some(ts);
		self
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
	Get,
	Set,
	Result,
	Error,
}

impl IqType {
	pub fn as_attr(self) -> &'static str {
		match self {
			Self::Get => "get",
			Self::Set => "set",
			Self::Result => "result",
			Self::Error => "error",
		}
	}

	pub fn from_attr(attr: Option<&str>) -> Option<Self> {
		match attr? {
			"get" => Some(Self::Get),
			"set" => Some(Self::Set),
			"result" => Some(Self::Result),
			"error" => Some(Self::Error),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
	pub category: &'static str,
	pub kind: &'static str,
	pub name: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IqPayload {
	DiscoInfo {
		identity: Identity,
		features: Vec<&'static str>,
	},
	/// muc#admin item.
	Affiliation {
		jid: String,
		affiliation: String,
		reason: Option<String>,
	},
	/// Accept the default room configuration.
	InstantRoom,
	Destroy {
		reason: Option<String>,
	},
	Empty,
	Error {
		condition: &'static str,
	},
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iq {
	pub from: String,
	pub to: String,
	pub id: String,
	pub kind: IqType,
	pub payload: IqPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stanza {
	Presence(Presence),
	Message(Message),
	Iq(Iq),
}

impl From<Presence> for Stanza {
	fn from(p: Presence) -> Self {
		Self::Presence(p)
	}
}

impl From<Message> for Stanza {
	fn from(m: Message) -> Self {
		Self::Message(m)
	}
}

impl From<Iq> for Stanza {
	fn from(iq: Iq) -> Self {
		Self::Iq(iq)
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OutboundError {
	#[error("component connection closed")]
	Closed,
	#[error("write failed: {0}")]
	Write(String),
}

/// Single outbound path to the XMPP server.
#[async_trait::async_trait]
pub trait OutboundSink: Send + Sync {
	async fn send(&self, stanza: Stanza) -> Result<(), OutboundError>;
}

/// `<error code=".." type=".."><condition/></error>` on an inbound stanza.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StanzaError {
	pub code: Option<String>,
	pub kind: Option<String>,
	pub condition: Option<String>,
}

/// muc#user `<item/>` plus status codes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MucItem {
	pub jid: Option<String>,
	pub role: Option<String>,
	pub affiliation: Option<String>,
	pub nick: Option<String>,
	pub status_codes: Vec<String>,
}

impl MucItem {
	pub fn has_status(&self, code: &str) -> bool {
		self.status_codes.iter().any(|c| c == code)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InPresence {
	pub from: String,
	pub to: String,
	pub kind: PresenceType,
	pub status: Option<String>,
	pub nick: Option<String>,
	pub error: Option<StanzaError>,
	pub muc: Option<MucItem>,
}

impl InPresence {
	pub fn new(from: impl Into<String>, to: impl Into<String>, kind: PresenceType) -> Self {
		Self {
			from: from.into(),
			to: to.into(),
			kind,
			status: None,
			nick: None,
			error: None,
			muc: None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InMessage {
	pub from: String,
	pub to: String,
	pub kind: MessageType,
	pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InIq {
	pub from: String,
	pub to: String,
	pub id: String,
	pub kind: IqType,
	/// Namespace of the first child, if any.
	pub query_ns: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
	Presence(InPresence),
	Message(InMessage),
	Iq(InIq),
}
