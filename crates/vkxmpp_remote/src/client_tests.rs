#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;
use vkxmpp_domain::{ChatId, Peer, RemoteId};

use crate::testing::{FakeTransport, captcha_error, client};
use crate::{ApiError, CallOptions, RemoteClient, RemoteTransport, SecretString};

#[tokio::test]
async fn authenticate_marks_online() {
	let transport = Arc::new(FakeTransport::default());
	let c = client(&transport);
	assert!(!c.is_online());
	c.authenticate().await.unwrap();
	assert!(c.is_online());
	assert_eq!(transport.methods(), vec!["isAppUser".to_string()]);

	let (_, params) = transport.calls.lock()[0].clone();
	assert!(params.contains(&("access_token".to_string(), "tok".to_string())));
	assert!(params.contains(&("v".to_string(), "5.81".to_string())));
}

#[tokio::test]
async fn authenticate_reports_invalid_token() {
	let transport = Arc::new(FakeTransport::default());
	transport.reply("isAppUser", Err(ApiError::TokenInvalid("revoked".into())));
	let c = client(&transport);
	assert!(matches!(c.authenticate().await, Err(ApiError::TokenInvalid(_))));
	assert!(!c.is_online());
}

#[tokio::test]
async fn offline_client_suppresses_unforced_calls() {
	let transport = Arc::new(FakeTransport::default());
	let c = client(&transport);
	let out = c.invoke("friends.get", &[], CallOptions::default()).await.unwrap();
	assert!(out.is_none());
	assert!(transport.methods().is_empty());
	assert_eq!(c.call_count(), 1);
}

#[tokio::test]
async fn captcha_freezes_until_solved() {
	let transport = Arc::new(FakeTransport::default());
	let c = client(&transport);
	c.authenticate().await.unwrap();

	transport.reply("messages.get", Err(captcha_error()));
	let err = c.messages(200, 10).await.unwrap_err();
	assert!(matches!(err, ApiError::CaptchaNeeded { .. }));
	assert!(c.is_frozen());
	assert!(!c.is_online());

	// Gate: no dispatch while frozen.
	let before = transport.methods().len();
	assert!(c.invoke("friends.get", &[], CallOptions::default()).await.unwrap().is_none());
	assert_eq!(transport.methods().len(), before);

	let waiter = {
		let c = Arc::clone(&c);
		tokio::spawn(async move { c.wait_until_unfrozen().await })
	};

	transport.reply("messages.get", Ok(json!({"count": 0, "items": []})));
	c.solve_captcha("abcd").await.unwrap();
	assert!(!c.is_frozen());
	assert!(c.is_online());
	timeout(Duration::from_millis(500), waiter)
		.await
		.expect("waiter released")
		.unwrap();

	let calls = transport.calls.lock();
	let (method, params) = calls.last().unwrap();
	assert_eq!(method, "messages.get");
	assert!(params.contains(&("captcha_sid".to_string(), "77".to_string())));
	assert!(params.contains(&("captcha_key".to_string(), "abcd".to_string())));
	assert!(params.contains(&("last_message_id".to_string(), "10".to_string())));
}

#[tokio::test]
async fn wrong_captcha_keeps_client_frozen() {
	let transport = Arc::new(FakeTransport::default());
	let c = client(&transport);
	transport.reply("isAppUser", Err(captcha_error()));
	assert!(matches!(c.authenticate().await, Err(ApiError::CaptchaNeeded { .. })));

	transport.reply("isAppUser", Err(captcha_error()));
	assert!(c.solve_captcha("nope").await.is_err());
	assert!(c.is_frozen());

	c.solve_captcha("right").await.unwrap();
	assert!(!c.is_frozen());
	let calls = transport.calls.lock();
	let (_, params) = calls.last().unwrap();
	let keys: Vec<_> = params.iter().filter(|(k, _)| k == "captcha_key").collect();
	assert_eq!(keys.len(), 1, "stale captcha answers are replaced");
}

#[tokio::test]
async fn forced_calls_bypass_the_gate() {
	let transport = Arc::new(FakeTransport::default());
	let c = client(&transport);
	transport.reply("isAppUser", Err(captcha_error()));
	let _ = c.authenticate().await;
	c.set_offline().await.unwrap();
	assert!(transport.methods().contains(&"account.setOffline".to_string()));
}

#[tokio::test]
async fn network_errors_mark_offline() {
	let transport = Arc::new(FakeTransport::default());
	let c = client(&transport);
	c.authenticate().await.unwrap();
	transport.reply("friends.get", Err(ApiError::NetworkUnavailable("reset".into())));
	assert!(c.friends().await.is_err());
	assert!(!c.is_online());

	// ensure_online re-authenticates.
	assert!(c.ensure_online().await.unwrap());
	assert!(c.is_online());
}

#[tokio::test]
async fn typed_helpers_decode_responses() {
	let transport = Arc::new(FakeTransport::default());
	let c = client(&transport);
	c.authenticate().await.unwrap();

	transport.reply(
		"friends.get",
		Ok(json!({"count": 2, "items": [
			{"id": 1, "first_name": "Pavel", "last_name": "D", "online": 1},
			{"id": 2, "first_name": "Ann", "last_name": "", "online": 0}
		]})),
	);
	let friends = c.friends().await.unwrap().unwrap();
	assert_eq!(friends.len(), 2);
	assert_eq!(friends[&RemoteId(1)].name, "Pavel D");
	assert!(friends[&RemoteId(1)].online);
	assert_eq!(friends[&RemoteId(2)].name, "Ann");

	transport.reply(
		"messages.get",
		Ok(json!({"count": 2, "items": [
			{"id": 9, "date": 100, "out": 0, "user_id": 5, "body": "hi"},
			{"id": 10, "date": 101, "out": 0, "user_id": 6, "body": "yo", "chat_id": 3, "attachments": [{"type": "photo"}]}
		]})),
	);
	let msgs = c.messages(200, 0).await.unwrap().unwrap();
	assert_eq!(msgs[0].peer, Peer::User(RemoteId(5)));
	assert!(!msgs[0].has_attachments);
	assert_eq!(msgs[1].peer, Peer::Chat(ChatId(3)));
	assert_eq!(msgs[1].from, RemoteId(6));
	assert!(msgs[1].has_attachments);

	transport.reply("users.get", Ok(json!([{"id": 42}])));
	assert_eq!(c.user_id().await.unwrap(), Some(RemoteId(42)));
	// cached
	assert_eq!(c.user_id().await.unwrap(), Some(RemoteId(42)));
	assert_eq!(transport.methods().iter().filter(|m| *m == "users.get").count(), 1);

	let fresh = client(&transport);
	fresh.set_online_flag(true);
	transport.reply("users.get", Ok(json!([{"id": 7, "first_name": "Alice", "last_name": "Liddell"}])));
	assert_eq!(fresh.own_name().await.unwrap().as_deref(), Some("Alice Liddell"));
	assert_eq!(fresh.user_id().await.unwrap(), Some(RemoteId(7)));
	transport.reply("users.get", Ok(json!([{"id": 7}])));
	assert_eq!(fresh.own_name().await.unwrap(), None);

	transport.reply(
		"messages.getLongPollServer",
		Ok(json!({"server": "im.example.org/im1", "key": "k", "ts": "1700"})),
	);
	let d = c.poll_server().await.unwrap().unwrap();
	assert_eq!(d.ts, 1700);
	assert_eq!(d.mode, 66);
}

#[tokio::test]
async fn shared_counter_counts_every_invocation() {
	let transport = Arc::new(FakeTransport::default());
	let shared = Arc::new(AtomicU64::new(0));
	let t: Arc<dyn RemoteTransport> = transport.clone();
	let c = RemoteClient::new(t, "bob@example.org", SecretString::new("tok"), "5.81").with_shared_counter(Arc::clone(&shared));
	c.authenticate().await.unwrap();
	let _ = c.invoke("friends.get", &[], CallOptions::default()).await;
	assert_eq!(shared.load(Ordering::Relaxed), 2);
}
