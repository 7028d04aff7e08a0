#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use vkxmpp_domain::{AccountId, ChatId, Peer, RoomJid, split_jid};
use vkxmpp_remote::RemoteMessage;

use crate::context::Context;
use crate::session::Session;
use crate::store::RoomRecord;
use crate::sync::SyncError;
use crate::sync::messages::{HandlerOutcome, MessageHandler};
use crate::text::{escape, unescape_html};
use crate::xmpp::caps::IDENTITY;
use crate::xmpp::{
	InMessage, InPresence, Iq, IqPayload, IqType, Message, MessageType, OutboundError, Presence, PresenceType,
	StanzaError,
};

/// What the caller should do after the bridge saw a stanza.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
	/// Not a room stanza the bridge cares about.
	Continue,
	/// Consumed.
	Stop(String),
}

impl Flow {
	fn stop(reason: impl Into<String>) -> Self {
		Self::Stop(reason.into())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
	PendingCreate,
	Created,
}

/// Decides what happens to gateway-domain occupants the bridge did not put in the room.
#[async_trait]
pub trait IntruderPolicy: Send + Sync {
	async fn on_intruder(&self, ctx: &Context, room: &RoomJid, jid: &str, nick: &str) -> Result<(), OutboundError>;
}

/// Makes the intruder leave the room.
pub struct LeaveIntruder;

pub const INTRUDER_REASON: &str = "I am not welcomed here";

#[async_trait]
impl IntruderPolicy for LeaveIntruder {
	async fn on_intruder(&self, ctx: &Context, room: &RoomJid, jid: &str, nick: &str) -> Result<(), OutboundError> {
		info!(room = %room, jid, "removing unexpected occupant");
		ctx.send(Presence::new(jid, room.occupant(nick), PresenceType::Unavailable).with_status(INTRUDER_REASON))
			.await
	}
}

/// One bridged remote multi-user chat.
#[derive(Debug)]
pub struct Groupchat {
	pub room: RoomJid,
	pub account: AccountId,
	pub chat_id: Option<ChatId>,
	pub state: RoomState,
	/// The gateway's own nickname in the room.
	pub own_nick: String,
	pub owner: Option<String>,
	pub owner_nickname: Option<String>,
	/// Contact JID → nickname, for occupants the bridge joined.
	participants: BTreeMap<String, String>,
	/// Nicknames of other occupants currently present.
	occupants: BTreeSet<String>,
	pending: Vec<(String, String)>,
}

impl Groupchat {
	fn new(room: RoomJid, account: AccountId, chat_id: Option<ChatId>) -> Self {
		Self {
			room,
			account,
			chat_id,
			state: RoomState::PendingCreate,
			own_nick: IDENTITY.name.to_string(),
			owner: None,
			owner_nickname: None,
			participants: BTreeMap::new(),
			occupants: BTreeSet::new(),
			pending: Vec::new(),
		}
	}

	/// A room that already exists on the server but is not tracked in memory.
	fn placeholder(record: RoomRecord) -> Self {
		let chat_id = record.room.chat_id();
		let mut chat = Self::new(record.room, record.account, chat_id);
		chat.state = RoomState::Created;
		chat.owner = record.owner_id;
		chat.owner_nickname = record.owner_nickname;
		chat
	}

	pub fn participant(&self, jid: &str) -> Option<&str> {
		self.participants.get(jid).map(String::as_str)
	}

	fn is_participant_nick(&self, nick: &str) -> bool {
		nick == self.own_nick || self.participants.values().any(|n| n == nick)
	}
}

fn is_conflict(err: &StanzaError) -> bool {
	let conflict = err.code.as_deref() == Some("409") || err.condition.as_deref() == Some("conflict");
	conflict && err.kind.as_deref() == Some("cancel")
}

fn is_refusal(err: &StanzaError) -> bool {
	matches!(err.code.as_deref(), Some("401" | "403" | "405"))
		|| matches!(err.condition.as_deref(), Some("not-authorized" | "forbidden" | "not-allowed"))
}

fn iq_id() -> String {
	format!("vkxmpp-{}", uuid::Uuid::new_v4())
}

fn join(from: impl Into<String>, room: &RoomJid, nick: &str) -> Presence {
	Presence::new(from, room.occupant(nick), PresenceType::Available).joining_room()
}

/// Maps remote multi-user chats onto conference rooms.
pub struct GroupchatBridge {
	ctx: Arc<Context>,
	conference_domain: String,
	policy: Box<dyn IntruderPolicy>,
	rooms: Mutex<HashMap<RoomJid, Groupchat>>,
}

impl GroupchatBridge {
	pub fn new(ctx: Arc<Context>, conference_domain: impl Into<String>) -> Self {
		Self::with_policy(ctx, conference_domain, Box::new(LeaveIntruder))
	}

	pub fn with_policy(ctx: Arc<Context>, conference_domain: impl Into<String>, policy: Box<dyn IntruderPolicy>) -> Self {
		Self {
			ctx,
			conference_domain: conference_domain.into().to_ascii_lowercase(),
			policy,
			rooms: Mutex::new(HashMap::new()),
		}
	}

	/// Whether `jid` lives on the conference domain.
	pub fn is_room_jid(&self, jid: &str) -> bool {
		let bare = split_jid(jid).0;
		bare.rsplit_once('@')
			.is_some_and(|(_, domain)| domain.eq_ignore_ascii_case(&self.conference_domain))
	}

	#[cfg(test)]
	pub async fn state(&self, room: &RoomJid) -> Option<RoomState> {
		self.rooms.lock().await.get(room).map(|c| c.state)
	}

	#[cfg(test)]
	pub async fn own_nick(&self, room: &RoomJid) -> Option<String> {
		self.rooms.lock().await.get(room).map(|c| c.own_nick.clone())
	}

	#[cfg(test)]
	pub async fn owner_nickname(&self, room: &RoomJid) -> Option<String> {
		self.rooms.lock().await.get(room).and_then(|c| c.owner_nickname.clone())
	}

	pub async fn room_account(&self, room: &RoomJid) -> Option<AccountId> {
		self.rooms.lock().await.get(room).map(|c| c.account.clone())
	}

	#[cfg(test)]
	pub async fn room_count(&self) -> usize {
		self.rooms.lock().await.len()
	}

	/// Forward a remote chat message into its room, creating the room on first use.
	pub async fn deliver(&self, session: &Session, message: &RemoteMessage) -> Result<(), OutboundError> {
		let Peer::Chat(chat_id) = message.peer else {
			return Ok(());
		};
		let ctx = &self.ctx;
		let room = RoomJid::for_chat(chat_id, &session.account, &self.conference_domain);
		let mut rooms = self.rooms.lock().await;

		if !rooms.contains_key(&room) {
			let chat = Groupchat::new(room.clone(), session.account.clone(), Some(chat_id));
			debug!(room = %room, account = %session.account, "creating room");
			ctx.send(join(ctx.gateway(), &room, &chat.own_nick)).await?;
			rooms.insert(room.clone(), chat);
			metrics::counter!("vkxmpp_rooms_created_total").increment(1);
		}
		let Some(chat) = rooms.get_mut(&room) else {
			return Ok(());
		};

		let from = ctx.jids.contact(message.from);
		if !chat.participants.contains_key(&from) {
			let nick = session
				.friend(message.from)
				.map(|f| f.name)
				.filter(|n| !n.is_empty())
				.unwrap_or_else(|| message.from.to_string());
			if chat.state == RoomState::Created {
				ctx.send(join(from.clone(), &room, &nick)).await?;
			}
			chat.participants.insert(from.clone(), nick);
		}

		let mut body = unescape_html(&message.body);
		if message.has_attachments {
			if !body.is_empty() {
				body.push('\n');
			}
			body.push_str("[attachment]");
		}
		let body = escape(&body);
		match chat.state {
			RoomState::Created => ctx.send(Message::groupchat(from, room.as_str(), body)).await?,
			_ => chat.pending.push((from, body)),
		}
		Ok(())
	}

	/// Presence from a room occupant.
	pub async fn handle_presence(&self, p: &InPresence) -> Result<Flow, OutboundError> {
		let (bare, nick) = split_jid(&p.from);
		let Ok(room) = RoomJid::new(bare) else {
			return Ok(Flow::Continue);
		};
		let nick = nick.unwrap_or_default();
		let ctx = &self.ctx;
		let mut rooms = self.rooms.lock().await;

		if !rooms.contains_key(&room) {
			// leftovers of a discarded room must not resurrect it
			if matches!(p.kind, PresenceType::Unavailable | PresenceType::Error) {
				return Ok(Flow::Continue);
			}
			return match ctx.store.room(&room).await {
				Ok(Some(record)) => {
					debug!(room = %room, "tracking existing room");
					rooms.insert(room, Groupchat::placeholder(record));
					Ok(Flow::stop("placeholder created"))
				}
				Ok(None) => Ok(Flow::Continue),
				Err(e) => {
					warn!(room = %room, error = %e, "room lookup failed");
					Ok(Flow::Continue)
				}
			};
		}
		let Some(chat) = rooms.get_mut(&room) else {
			return Ok(Flow::Continue);
		};

		if p.kind == PresenceType::Error {
			let err = p.error.clone().unwrap_or_default();
			if is_refusal(&err) && ctx.jids.is_gateway(&p.to) && chat.state == RoomState::PendingCreate {
				warn!(
					room = %room,
					code = ?err.code,
					condition = ?err.condition,
					"room creation refused"
				);
				rooms.remove(&room);
				metrics::counter!("vkxmpp_room_failures_total").increment(1);
				return Ok(Flow::stop("room creation refused"));
			}
			return self.handle_error(chat, p, &err).await;
		}

		let item = p.muc.clone().unwrap_or_default();
		let item_bare = item.jid.as_deref().map(|j| split_jid(j).0.to_ascii_lowercase());

		if item.has_status("303") {
			if item_bare.as_deref() == Some(chat.account.as_str())
				&& let Some(new_nick) = item.nick.clone()
			{
				debug!(room = %room, nick = %new_nick, "owner changed nickname");
				chat.owner_nickname = Some(new_nick.clone());
				if let Err(e) = ctx.store.update_room_nickname(&room, &new_nick).await {
					warn!(room = %room, error = %e, "failed to persist owner nickname");
				}
			}
			return Ok(Flow::stop("nickname change"));
		}

		let to_gateway = ctx.jids.is_gateway(&p.to);
		if to_gateway && nick == chat.own_nick {
			if chat.state == RoomState::PendingCreate && p.kind == PresenceType::Available {
				self.on_created(chat).await?;
			}
			return Ok(Flow::stop("own presence"));
		}

		if let Some(jid) = item.jid.as_deref() {
			let jid_bare = split_jid(jid).0.to_ascii_lowercase();
			if chat.state == RoomState::Created
				&& p.kind != PresenceType::Unavailable
				&& ctx.jids.is_local(jid)
				&& !ctx.jids.is_gateway(jid)
				&& !chat.participants.contains_key(&jid_bare)
			{
				self.policy.on_intruder(ctx, &room, &jid_bare, nick).await?;
			}

			if item.role.as_deref() == Some("moderator")
				&& item.affiliation.as_deref() == Some("owner")
				&& !ctx.jids.is_gateway(jid)
				&& chat.owner.as_deref() != Some(jid_bare.as_str())
			{
				chat.owner = Some(jid_bare.clone());
				if let Err(e) = ctx.store.update_room_owner(&room, &jid_bare).await {
					warn!(room = %room, error = %e, "failed to persist room owner");
				}
			}

			if jid_bare == chat.account.as_str() && chat.owner_nickname.as_deref() != Some(nick) {
				chat.owner_nickname = Some(nick.to_string());
				if let Err(e) = ctx.store.update_room_nickname(&room, nick).await {
					warn!(room = %room, error = %e, "failed to persist owner nickname");
				}
			}
		}

		let bridged = item.jid.as_deref().is_some_and(|j| ctx.jids.is_local(j));
		if !to_gateway || bridged || chat.is_participant_nick(nick) {
			return Ok(Flow::stop("occupant presence"));
		}
		if p.kind == PresenceType::Unavailable {
			chat.occupants.remove(nick);
			if chat.occupants.is_empty() && chat.state == RoomState::Created {
				let chat = rooms.remove(&room);
				if let Some(chat) = chat {
					self.destroy(chat).await?;
				}
				return Ok(Flow::stop("room destroyed"));
			}
		} else {
			chat.occupants.insert(nick.to_string());
		}
		Ok(Flow::stop("occupant presence"))
	}

	async fn handle_error(&self, chat: &mut Groupchat, p: &InPresence, err: &StanzaError) -> Result<Flow, OutboundError> {
		let ctx = &self.ctx;
		if is_conflict(err) {
			if ctx.jids.is_gateway(&p.to) {
				chat.own_nick.push('.');
				debug!(room = %chat.room, nick = %chat.own_nick, state = ?chat.state, "nickname taken, rejoining");
				ctx.send(join(ctx.gateway(), &chat.room, &chat.own_nick)).await?;
				return Ok(Flow::stop("nickname conflict"));
			}
			let to = split_jid(&p.to).0.to_ascii_lowercase();
			if let Some(nick) = chat.participants.get_mut(&to) {
				nick.push('.');
				let nick = nick.clone();
				debug!(room = %chat.room, jid = %to, nick = %nick, "occupant nickname taken, rejoining");
				ctx.send(join(to, &chat.room, &nick)).await?;
			}
			return Ok(Flow::stop("nickname conflict"));
		}

		if is_refusal(err) {
			let to = split_jid(&p.to).0.to_ascii_lowercase();
			if chat.participants.remove(&to).is_some() {
				warn!(room = %chat.room, jid = %to, code = ?err.code, "occupant refused, dropping participant");
				chat.pending.retain(|(from, _)| *from != to);
				return Ok(Flow::stop("participant refused"));
			}
		}

		debug!(room = %chat.room, code = ?err.code, condition = ?err.condition, "room error presence");
		Ok(Flow::stop("room error"))
	}

	async fn on_created(&self, chat: &mut Groupchat) -> Result<(), OutboundError> {
		let ctx = &self.ctx;
		chat.state = RoomState::Created;
		info!(room = %chat.room, account = %chat.account, "room created");

		ctx.send(Iq {
			from: ctx.gateway().to_string(),
			to: chat.room.to_string(),
			id: iq_id(),
			kind: IqType::Set,
			payload: IqPayload::InstantRoom,
		})
		.await?;
		ctx.send(Iq {
			from: ctx.gateway().to_string(),
			to: chat.room.to_string(),
			id: iq_id(),
			kind: IqType::Set,
			payload: IqPayload::Affiliation {
				jid: chat.account.to_string(),
				affiliation: "owner".to_string(),
				reason: None,
			},
		})
		.await?;

		for (jid, nick) in &chat.participants {
			ctx.send(join(jid.clone(), &chat.room, nick)).await?;
		}
		for (from, body) in chat.pending.drain(..) {
			ctx.send(Message::groupchat(from, chat.room.as_str(), body)).await?;
		}

		let record = RoomRecord {
			room: chat.room.clone(),
			account: chat.account.clone(),
			owner_id: chat.owner.clone(),
			owner_nickname: chat.owner_nickname.clone(),
		};
		if let Err(e) = ctx.store.upsert_room(&record).await {
			warn!(room = %chat.room, error = %e, "failed to persist room");
		}
		ctx.send(Message::chat(
			ctx.gateway(),
			chat.account.as_str(),
			format!("A remote group chat is available at {}", chat.room),
		))
		.await
	}

	async fn destroy(&self, chat: Groupchat) -> Result<(), OutboundError> {
		let ctx = &self.ctx;
		info!(room = %chat.room, "last occupant left, destroying room");
		if let Err(e) = ctx.store.delete_room(&chat.room).await {
			warn!(room = %chat.room, error = %e, "failed to delete room record");
		}
		ctx.send(Iq {
			from: ctx.gateway().to_string(),
			to: chat.room.to_string(),
			id: iq_id(),
			kind: IqType::Set,
			payload: IqPayload::Destroy { reason: None },
		})
		.await
	}

	/// A groupchat message reflected to the gateway's occupant. Messages from the owner go to the remote chat.
	pub async fn handle_message(&self, session: &Session, m: &InMessage) -> Result<Flow, SyncError> {
		if m.kind != MessageType::Groupchat || !self.ctx.jids.is_gateway(&m.to) {
			return Ok(Flow::Continue);
		}
		let (bare, nick) = split_jid(&m.from);
		let Ok(room) = RoomJid::new(bare) else {
			return Ok(Flow::Continue);
		};
		let Some(nick) = nick else {
			return Ok(Flow::stop("room subject or notice"));
		};
		let target = {
			let rooms = self.rooms.lock().await;
			let Some(chat) = rooms.get(&room) else {
				return Ok(Flow::Continue);
			};
			let from_owner = match &chat.owner_nickname {
				Some(owner) => owner == nick,
				None => !chat.is_participant_nick(nick),
			};
			if chat.account != session.account || !from_owner || chat.state != RoomState::Created {
				return Ok(Flow::stop("not from the owner"));
			}
			chat.chat_id
		};
		let (Some(chat_id), Some(body)) = (target, m.body.as_deref()) else {
			return Ok(Flow::stop("nothing to forward"));
		};
		session.client.send_message(Peer::Chat(chat_id), body).await?;
		self.ctx.stats.outgoing();
		Ok(Flow::stop("forwarded"))
	}
}

/// Claims remote multi-chat messages and routes them to the bridge.
pub struct GroupchatHandler {
	bridge: Arc<GroupchatBridge>,
}

impl GroupchatHandler {
	pub fn new(bridge: Arc<GroupchatBridge>) -> Self {
		Self { bridge }
	}
}

#[async_trait]
impl MessageHandler for GroupchatHandler {
	fn name(&self) -> &'static str {
		"groupchat"
	}

	async fn handle(&self, session: &Session, message: &RemoteMessage) -> anyhow::Result<HandlerOutcome> {
		if !matches!(message.peer, Peer::Chat(_)) {
			return Ok(HandlerOutcome::Append(String::new()));
		}
		self.bridge.deliver(session, message).await?;
		Ok(HandlerOutcome::Handled)
	}
}

#[cfg(test)]
mod groupchat_tests;
