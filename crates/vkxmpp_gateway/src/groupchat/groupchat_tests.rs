#![forbid(unsafe_code)]

use std::sync::Arc;

use vkxmpp_domain::{ChatId, Peer, RemoteId, RoomJid};
use vkxmpp_remote::RemoteMessage;

use super::{Flow, GroupchatBridge, GroupchatHandler, INTRUDER_REASON, RoomState};
use crate::session::Session;
use crate::store::{AccountStore, RoomRecord};
use crate::sync::messages::MessageSync;
use crate::testing::{CONFERENCE, GATEWAY, TestHarness, account};
use crate::xmpp::{
	InMessage, InPresence, IqPayload, MessageType, MucItem, PresenceType, Stanza, StanzaError,
};

const ROOM: &str = "chat5_alice@conference.example.org";
const NICK: &str = "VK4XMPP Transport";

fn room() -> RoomJid {
	RoomJid::new(ROOM).unwrap()
}

fn chat_msg(id: i64, from: i64, body: &str) -> RemoteMessage {
	RemoteMessage {
		id,
		from: RemoteId(from),
		peer: Peer::Chat(ChatId(5)),
		date: 0,
		out: false,
		body: body.to_string(),
		has_attachments: false,
	}
}

fn from_room(nick: &str, to: &str, kind: PresenceType) -> InPresence {
	InPresence::new(format!("{ROOM}/{nick}"), to, kind)
}

fn with_item(mut p: InPresence, jid: &str, role: &str, affiliation: &str) -> InPresence {
	p.muc = Some(MucItem {
		jid: Some(jid.to_string()),
		role: Some(role.to_string()),
		affiliation: Some(affiliation.to_string()),
		..MucItem::default()
	});
	p
}

fn error(code: &str, kind: &str, condition: &str, to: &str, nick: &str) -> InPresence {
	let mut p = from_room(nick, to, PresenceType::Error);
	p.error = Some(StanzaError {
		code: Some(code.to_string()),
		kind: Some(kind.to_string()),
		condition: Some(condition.to_string()),
	});
	p
}

fn groupchat_bodies(h: &TestHarness) -> Vec<String> {
	h.sink
		.messages()
		.into_iter()
		.filter(|m| m.kind == MessageType::Groupchat)
		.filter_map(|m| m.body)
		.collect()
}

async fn created(h: &TestHarness) -> (Arc<Session>, Arc<GroupchatBridge>) {
	let session = h.session(&account("alice@example.org"));
	let bridge = Arc::new(GroupchatBridge::new(h.ctx.clone(), CONFERENCE));
	bridge.deliver(&session, &chat_msg(1, 10, "hi")).await.unwrap();
	bridge
		.handle_presence(&from_room(NICK, GATEWAY, PresenceType::Available))
		.await
		.unwrap();
	assert_eq!(bridge.state(&room()).await, Some(RoomState::Created));
	h.sink.take();
	(session, bridge)
}

#[tokio::test]
async fn creation_race_converges_to_one_room() {
	let h = TestHarness::new();
	let session = h.session(&account("alice@example.org"));
	let bridge = Arc::new(GroupchatBridge::new(h.ctx.clone(), CONFERENCE));

	let (one, two) = (chat_msg(1, 10, "one"), chat_msg(2, 11, "two"));
	let (a, b) = tokio::join!(bridge.deliver(&session, &one), bridge.deliver(&session, &two));
	a.unwrap();
	b.unwrap();
	assert_eq!(bridge.room_count().await, 1);
	let gateway_joins = h.sink.presences().into_iter().filter(|p| p.from == GATEWAY).count();
	assert_eq!(gateway_joins, 1);
	assert!(groupchat_bodies(&h).is_empty(), "messages wait for the room");

	let flow = bridge
		.handle_presence(&error("409", "cancel", "conflict", GATEWAY, NICK))
		.await
		.unwrap();
	assert!(matches!(flow, Flow::Stop(_)));
	let rejoin = h.sink.presences().pop().unwrap();
	assert_eq!(rejoin.from, GATEWAY);
	assert_eq!(rejoin.to, format!("{ROOM}/{NICK}."));
	assert!(rejoin.muc_join);

	bridge
		.handle_presence(&from_room(&format!("{NICK}."), GATEWAY, PresenceType::Available))
		.await
		.unwrap();
	bridge
		.handle_presence(&from_room(&format!("{NICK}."), GATEWAY, PresenceType::Available))
		.await
		.unwrap();
	assert_eq!(bridge.state(&room()).await, Some(RoomState::Created));
	assert_eq!(bridge.own_nick(&room()).await.as_deref(), Some("VK4XMPP Transport."));

	let iqs = h.sink.iqs();
	assert_eq!(iqs.len(), 2, "room configured exactly once");
	assert_eq!(iqs[0].payload, IqPayload::InstantRoom);
	assert!(matches!(&iqs[1].payload, IqPayload::Affiliation { jid, affiliation, .. }
		if jid == "alice@example.org" && affiliation == "owner"));

	assert_eq!(groupchat_bodies(&h), vec!["one", "two"]);
	let contact_joins: Vec<_> = h
		.sink
		.presences()
		.into_iter()
		.filter(|p| p.from != GATEWAY)
		.map(|p| p.to)
		.collect();
	assert_eq!(contact_joins, vec![format!("{ROOM}/10"), format!("{ROOM}/11")]);
	assert!(h.store.room(&room()).await.unwrap().is_some());
}

#[tokio::test]
async fn occupant_conflict_rejoins_with_suffix() {
	let h = TestHarness::new();
	let (_session, bridge) = created(&h).await;

	bridge
		.handle_presence(&error("409", "cancel", "conflict", "10@vk.example.org", "10"))
		.await
		.unwrap();
	let p = h.sink.presences().pop().unwrap();
	assert_eq!(p.from, "10@vk.example.org");
	assert_eq!(p.to, format!("{ROOM}/10."));
	assert_eq!(bridge.state(&room()).await, Some(RoomState::Created));
}

#[tokio::test]
async fn refused_creation_discards_room_until_next_message() {
	let h = TestHarness::new();
	let session = h.session(&account("alice@example.org"));
	let bridge = GroupchatBridge::new(h.ctx.clone(), CONFERENCE);
	bridge.deliver(&session, &chat_msg(1, 10, "hi")).await.unwrap();

	let flow = bridge
		.handle_presence(&error("403", "auth", "forbidden", GATEWAY, NICK))
		.await
		.unwrap();
	assert_eq!(flow, Flow::Stop("room creation refused".to_string()));
	assert_eq!(bridge.state(&room()).await, None);
	assert_eq!(bridge.room_count().await, 0);

	h.sink.take();
	for p in [
		from_room(NICK, GATEWAY, PresenceType::Available),
		error("403", "auth", "forbidden", GATEWAY, NICK),
	] {
		assert_eq!(bridge.handle_presence(&p).await.unwrap(), Flow::Continue);
	}
	assert!(h.sink.take().is_empty());
	assert_eq!(bridge.room_count().await, 0);

	bridge.deliver(&session, &chat_msg(2, 10, "again")).await.unwrap();
	assert_eq!(bridge.state(&room()).await, Some(RoomState::PendingCreate));
	assert_eq!(bridge.own_nick(&room()).await.as_deref(), Some(NICK));
}

#[tokio::test]
async fn refused_participant_leaves_created_room_intact() {
	let h = TestHarness::new();
	let (session, bridge) = created(&h).await;

	let flow = bridge
		.handle_presence(&error("403", "auth", "forbidden", "10@vk.example.org", "10"))
		.await
		.unwrap();
	assert_eq!(flow, Flow::Stop("participant refused".to_string()));
	assert_eq!(bridge.state(&room()).await, Some(RoomState::Created));

	bridge.deliver(&session, &chat_msg(2, 11, "still here")).await.unwrap();
	let gateway_joins = h.sink.presences().into_iter().filter(|p| p.from == GATEWAY).count();
	assert_eq!(gateway_joins, 0, "room is not recreated");
	assert_eq!(groupchat_bodies(&h), vec!["still here"]);

	// a refusal bounced to the gateway after creation does not tear the room down either
	bridge
		.handle_presence(&error("405", "cancel", "not-allowed", GATEWAY, NICK))
		.await
		.unwrap();
	assert_eq!(bridge.state(&room()).await, Some(RoomState::Created));
}

#[tokio::test]
async fn gateway_conflict_in_created_room_rejoins_with_suffix() {
	let h = TestHarness::new();
	let (_session, bridge) = created(&h).await;

	bridge
		.handle_presence(&error("409", "cancel", "conflict", GATEWAY, NICK))
		.await
		.unwrap();
	let rejoin = h.sink.presences().pop().unwrap();
	assert_eq!(rejoin.from, GATEWAY);
	assert_eq!(rejoin.to, format!("{ROOM}/{NICK}."));
	assert!(rejoin.muc_join);
	assert_eq!(bridge.own_nick(&room()).await.as_deref(), Some("VK4XMPP Transport."));
	assert_eq!(bridge.state(&room()).await, Some(RoomState::Created));
	assert!(h.sink.iqs().is_empty(), "room is not reconfigured");
}

#[tokio::test]
async fn nick_change_of_owner_is_persisted() {
	let h = TestHarness::new();
	let (_session, bridge) = created(&h).await;

	let mut p = with_item(
		from_room("Alice", GATEWAY, PresenceType::Unavailable),
		"alice@example.org/pc",
		"moderator",
		"owner",
	);
	if let Some(item) = p.muc.as_mut() {
		item.nick = Some("Alicia".to_string());
		item.status_codes = vec!["303".to_string()];
	}
	bridge.handle_presence(&p).await.unwrap();
	assert_eq!(bridge.owner_nickname(&room()).await.as_deref(), Some("Alicia"));
	let record = h.store.room(&room()).await.unwrap().unwrap();
	assert_eq!(record.owner_nickname.as_deref(), Some("Alicia"));
	assert!(h.sink.iqs().is_empty(), "a nick change is not a departure");
}

#[tokio::test]
async fn unexpected_gateway_occupant_is_removed() {
	let h = TestHarness::new();
	let (_session, bridge) = created(&h).await;

	let known = with_item(
		from_room("10", GATEWAY, PresenceType::Available),
		"10@vk.example.org",
		"participant",
		"none",
	);
	bridge.handle_presence(&known).await.unwrap();
	assert!(h.sink.presences().is_empty());

	let stranger = with_item(
		from_room("stranger", GATEWAY, PresenceType::Available),
		"99@vk.example.org/x",
		"participant",
		"none",
	);
	bridge.handle_presence(&stranger).await.unwrap();
	let out = h.sink.presences();
	assert_eq!(out.len(), 1);
	assert_eq!(out[0].from, "99@vk.example.org");
	assert_eq!(out[0].to, format!("{ROOM}/stranger"));
	assert_eq!(out[0].kind, PresenceType::Unavailable);
	assert_eq!(out[0].status.as_deref(), Some(INTRUDER_REASON));
}

#[tokio::test]
async fn owner_and_owner_nickname_tracked_from_presence() {
	let h = TestHarness::new();
	let (_session, bridge) = created(&h).await;

	let bob = with_item(
		from_room("Bob", GATEWAY, PresenceType::Available),
		"bob@example.org/home",
		"moderator",
		"owner",
	);
	bridge.handle_presence(&bob).await.unwrap();
	let alice = with_item(
		from_room("Alice", GATEWAY, PresenceType::Available),
		"alice@example.org/pc",
		"participant",
		"member",
	);
	bridge.handle_presence(&alice).await.unwrap();

	let record = h.store.room(&room()).await.unwrap().unwrap();
	assert_eq!(record.owner_id.as_deref(), Some("bob@example.org"));
	assert_eq!(record.owner_nickname.as_deref(), Some("Alice"));
}

#[tokio::test]
async fn untracked_room_gets_placeholder() {
	let h = TestHarness::new();
	let bridge = GroupchatBridge::new(h.ctx.clone(), CONFERENCE);

	let flow = bridge
		.handle_presence(&from_room("x", GATEWAY, PresenceType::Unavailable))
		.await
		.unwrap();
	assert_eq!(flow, Flow::Continue);

	h.store
		.upsert_room(&RoomRecord {
			room: room(),
			account: account("alice@example.org"),
			owner_id: None,
			owner_nickname: Some("Alice".to_string()),
		})
		.await
		.unwrap();
	let flow = bridge
		.handle_presence(&from_room("x", GATEWAY, PresenceType::Available))
		.await
		.unwrap();
	assert_eq!(flow, Flow::Stop("placeholder created".to_string()));
	assert_eq!(bridge.state(&room()).await, Some(RoomState::Created));
	assert_eq!(bridge.room_account(&room()).await, Some(account("alice@example.org")));
	assert_eq!(bridge.owner_nickname(&room()).await.as_deref(), Some("Alice"));
}

#[tokio::test]
async fn owner_messages_are_forwarded_to_the_chat() {
	let h = TestHarness::new();
	let (session, bridge) = created(&h).await;
	let alice = with_item(
		from_room("Alice", GATEWAY, PresenceType::Available),
		"alice@example.org/pc",
		"moderator",
		"owner",
	);
	bridge.handle_presence(&alice).await.unwrap();

	let msg = |nick: &str| InMessage {
		from: format!("{ROOM}/{nick}"),
		to: GATEWAY.to_string(),
		kind: MessageType::Groupchat,
		body: Some("hello".to_string()),
	};
	assert_eq!(
		bridge.handle_message(&session, &msg("10")).await.unwrap(),
		Flow::Stop("not from the owner".to_string())
	);
	assert_eq!(h.transport.count("messages.send"), 0);

	assert_eq!(
		bridge.handle_message(&session, &msg("Alice")).await.unwrap(),
		Flow::Stop("forwarded".to_string())
	);
	let params = h.transport.last_params("messages.send").unwrap();
	assert!(params.contains(&("chat_id".to_string(), "5".to_string())));
	assert!(params.contains(&("message".to_string(), "hello".to_string())));
}

#[tokio::test]
async fn last_occupant_leaving_destroys_room() {
	let h = TestHarness::new();
	let (_session, bridge) = created(&h).await;
	let alice = |kind| with_item(from_room("Alice", GATEWAY, kind), "alice@example.org/pc", "moderator", "owner");

	bridge.handle_presence(&alice(PresenceType::Available)).await.unwrap();
	bridge.handle_presence(&alice(PresenceType::Unavailable)).await.unwrap();

	assert_eq!(bridge.state(&room()).await, None);
	assert!(h.store.room(&room()).await.unwrap().is_none());
	let destroy = h.sink.iqs().pop().unwrap();
	assert!(matches!(destroy.payload, IqPayload::Destroy { .. }));
	assert_eq!(destroy.to, ROOM);
}

#[tokio::test]
async fn handler_claims_chat_messages() {
	let h = TestHarness::new();
	let session = h.session(&account("alice@example.org"));
	let bridge = Arc::new(GroupchatBridge::new(h.ctx.clone(), CONFERENCE));
	let sync = MessageSync::new(vec![Arc::new(GroupchatHandler::new(bridge.clone()))]);

	let mut direct = chat_msg(4, 10, "direct");
	direct.peer = Peer::User(RemoteId(10));
	sync.sync(&h.ctx, &session, false, Some(vec![chat_msg(3, 10, "room"), direct]))
		.await
		.unwrap();

	let chats: Vec<_> = h
		.sink
		.take()
		.into_iter()
		.filter_map(|s| match s {
			Stanza::Message(m) if m.kind == MessageType::Chat => m.body,
			_ => None,
		})
		.collect();
	assert_eq!(chats, vec!["direct"]);
	assert_eq!(bridge.state(&room()).await, Some(RoomState::PendingCreate));
	assert!(bridge.is_room_jid("chat5_alice@conference.example.org/nick"));
	assert!(!bridge.is_room_jid("5@vk.example.org"));
}
