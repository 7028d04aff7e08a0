#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use vkxmpp_domain::RemoteId;
use vkxmpp_remote::Friend;

use super::SyncError;
use crate::context::Context;
use crate::session::Session;
use crate::xmpp::caps::IDENTITY;
use crate::xmpp::{ChatState, Message, OutboundError, Presence, PresenceType};

/// Typing entries idle for longer than this are swept with `paused`.
pub const TYPING_TIMEOUT: Duration = Duration::from_secs(7);

#[derive(Debug, Default, PartialEq, Eq)]
pub struct FriendDiff {
	pub added: Vec<(RemoteId, Friend)>,
	pub removed: Vec<RemoteId>,
}

pub fn diff_friends(old: &BTreeMap<RemoteId, Friend>, new: &BTreeMap<RemoteId, Friend>) -> FriendDiff {
	FriendDiff {
		added: new
			.iter()
			.filter(|(id, _)| !old.contains_key(id))
			.map(|(id, f)| (*id, f.clone()))
			.collect(),
		removed: old.keys().filter(|id| !new.contains_key(id)).copied().collect(),
	}
}

/// Re-fetch the friend list when due and push the roster difference. Returns whether a refresh ran.
pub async fn refresh_friends(ctx: &Context, session: &Session, now: Instant, interval: Duration) -> Result<bool, SyncError> {
	if session.client.is_frozen() || !session.friends_refresh_due(now, interval) {
		return Ok(false);
	}
	session.mark_friends_refreshed(now);

	if session.settings.keep_online() {
		session.client.set_online().await?;
	}

	let friends = match session.client.friends().await? {
		Some(f) if !f.is_empty() => f,
		_ => {
			warn!(account = %session.account, "friends refresh returned nothing; keeping cached list");
			return Ok(false);
		}
	};

	let diff = diff_friends(&session.friends(), &friends);
	let to = session.account.as_str();
	for (id, friend) in &diff.added {
		ctx.send(Presence::new(ctx.jids.contact(*id), to, PresenceType::Subscribe).with_nick(friend.name.clone()))
			.await?;
	}
	for id in &diff.removed {
		ctx.send(Presence::new(ctx.jids.contact(*id), to, PresenceType::Unsubscribe))
			.await?;
	}
	if !diff.added.is_empty() || !diff.removed.is_empty() {
		debug!(
			account = %session.account,
			added = diff.added.len(),
			removed = diff.removed.len(),
			"friend list changed"
		);
	}
	session.set_friends(friends);
	Ok(true)
}

/// `composing` is sent only when `id` starts typing.
pub async fn typing_started(ctx: &Context, session: &Session, id: RemoteId, now: Instant) -> Result<(), OutboundError> {
	if session.mark_typing(id, now) {
		ctx.send(Message::chat_state(ctx.jids.contact(id), session.account.as_str(), ChatState::Composing))
			.await?;
	}
	Ok(())
}

pub async fn sweep_typing(ctx: &Context, session: &Session, now: Instant) -> Result<(), OutboundError> {
	for id in session.take_idle_typers(now, TYPING_TIMEOUT) {
		ctx.send(Message::chat_state(ctx.jids.contact(id), session.account.as_str(), ChatState::Paused))
			.await?;
	}
	Ok(())
}

/// Available presence from every online friend, then from the gateway.
pub async fn send_init_presence(ctx: &Context, session: &Session) -> Result<(), SyncError> {
	if session.client.is_frozen() {
		return Ok(());
	}
	if !session.has_friends()
		&& let Some(friends) = session.client.friends().await?
	{
		session.set_friends(friends);
	}

	let to = session.account.as_str();
	let friends = session.friends();
	debug!(account = %session.account, friends = friends.len(), "sending initial presence");
	for (id, _) in friends.iter().filter(|(_, f)| f.online) {
		ctx.send(Presence::new(ctx.jids.contact(*id), to, PresenceType::Available).with_caps(ctx.user_caps.clone()))
			.await?;
	}
	ctx.send(Presence::new(ctx.gateway(), to, PresenceType::Available).with_caps(ctx.gateway_caps.clone()))
		.await?;
	Ok(())
}

/// Unavailable presence from friends (online ones unless `all`) and the gateway.
pub async fn send_out_presence(
	ctx: &Context,
	session: &Session,
	reason: Option<&str>,
	all: bool,
) -> Result<(), OutboundError> {
	let to = session.account.as_str();
	let mut sources: Vec<String> = session
		.friends()
		.iter()
		.filter(|(_, f)| all || f.online)
		.map(|(id, _)| ctx.jids.contact(*id))
		.collect();
	sources.push(ctx.gateway().to_string());

	for from in sources {
		let mut p = Presence::new(from, to, PresenceType::Unavailable);
		if let Some(reason) = reason {
			p = p.with_status(reason);
		}
		ctx.send(p).await?;
	}
	Ok(())
}

/// Ask the owner to add `friends` and the gateway to the roster.
pub async fn send_sub_presence(
	ctx: &Context,
	session: &Session,
	friends: &BTreeMap<RemoteId, Friend>,
) -> Result<(), OutboundError> {
	let to = session.account.as_str();
	for (id, friend) in friends {
		ctx.send(Presence::new(ctx.jids.contact(*id), to, PresenceType::Subscribe).with_nick(friend.name.clone()))
			.await?;
	}
	ctx.send(Presence::new(ctx.gateway(), to, PresenceType::Subscribe).with_nick(IDENTITY.name))
		.await?;

	if !friends.is_empty() {
		session.mark_roster_set();
		if let Err(e) = ctx.store.update_roster_set(&session.account, true).await {
			warn!(account = %session.account, error = %e, "failed to persist roster flag");
		}
	}
	Ok(())
}

pub async fn user_joined(ctx: &Context, session: &Session, id: RemoteId) -> Result<(), OutboundError> {
	session.set_friend_online(id, true);
	ctx.send(
		Presence::new(ctx.jids.contact(id), session.account.as_str(), PresenceType::Available)
			.with_caps(ctx.user_caps.clone()),
	)
	.await
}

pub async fn user_left(ctx: &Context, session: &Session, id: RemoteId) -> Result<(), OutboundError> {
	session.set_friend_online(id, false);
	ctx.send(Presence::new(ctx.jids.contact(id), session.account.as_str(), PresenceType::Unavailable))
		.await
}
