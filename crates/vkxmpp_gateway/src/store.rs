#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{Context, anyhow};
use tokio::sync::Mutex;
use vkxmpp_domain::{AccountId, RoomJid};
use vkxmpp_remote::SecretString;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
	pub account: AccountId,
	pub display_name: Option<String>,
	pub token: SecretString,
	/// Id of the newest delivered remote message.
	pub cursor: i64,
	pub roster_set: bool,
}

impl AccountRecord {
	pub fn new(account: AccountId, token: SecretString) -> Self {
		Self {
			account,
			display_name: None,
			token,
			cursor: 0,
			roster_set: false,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomRecord {
	pub room: RoomJid,
	/// Linked account the room was created for.
	pub account: AccountId,
	/// Occupant JID persisted as the room owner.
	pub owner_id: Option<String>,
	pub owner_nickname: Option<String>,
}

/// Durable account/room storage.
#[async_trait::async_trait]
pub trait AccountStore: Send + Sync {
	/// Insert a new account or refresh token and display name of an existing one.
	async fn upsert_account(&self, record: &AccountRecord) -> anyhow::Result<()>;
	async fn update_token(&self, account: &AccountId, token: &SecretString) -> anyhow::Result<()>;
	async fn update_display_name(&self, account: &AccountId, name: &str) -> anyhow::Result<()>;
	/// Only ever moves the cursor forward.
	async fn update_cursor(&self, account: &AccountId, cursor: i64) -> anyhow::Result<()>;
	async fn update_roster_set(&self, account: &AccountId, roster_set: bool) -> anyhow::Result<()>;
	/// Removes the account and its rooms. Returns whether a record existed.
	async fn delete_account(&self, account: &AccountId) -> anyhow::Result<bool>;
	async fn account(&self, account: &AccountId) -> anyhow::Result<Option<AccountRecord>>;
	async fn accounts(&self) -> anyhow::Result<Vec<AccountRecord>>;
	async fn count(&self) -> anyhow::Result<u64>;

	async fn upsert_room(&self, record: &RoomRecord) -> anyhow::Result<()>;
	async fn room(&self, room: &RoomJid) -> anyhow::Result<Option<RoomRecord>>;
	async fn update_room_owner(&self, room: &RoomJid, owner_id: &str) -> anyhow::Result<()>;
	async fn update_room_nickname(&self, room: &RoomJid, nickname: &str) -> anyhow::Result<()>;
	async fn delete_room(&self, room: &RoomJid) -> anyhow::Result<()>;
}

#[derive(Default)]
struct InMemoryState {
	accounts: HashMap<AccountId, AccountRecord>,
	rooms: HashMap<RoomJid, RoomRecord>,
}

#[derive(Default)]
pub struct InMemoryStore {
	inner: Mutex<InMemoryState>,
}

#[async_trait::async_trait]
impl AccountStore for InMemoryStore {
	async fn upsert_account(&self, record: &AccountRecord) -> anyhow::Result<()> {
		let mut guard = self.inner.lock().await;
		match guard.accounts.get_mut(&record.account) {
			Some(existing) => {
				existing.token = record.token.clone();
				existing.display_name = record.display_name.clone();
			}
			None => {
				guard.accounts.insert(record.account.clone(), record.clone());
			}
		}
		Ok(())
	}

	async fn update_token(&self, account: &AccountId, token: &SecretString) -> anyhow::Result<()> {
		if let Some(rec) = self.inner.lock().await.accounts.get_mut(account) {
			rec.token = token.clone();
		}
		Ok(())
	}

	async fn update_display_name(&self, account: &AccountId, name: &str) -> anyhow::Result<()> {
		if let Some(rec) = self.inner.lock().await.accounts.get_mut(account) {
			rec.display_name = Some(name.to_string());
		}
		Ok(())
	}

	async fn update_cursor(&self, account: &AccountId, cursor: i64) -> anyhow::Result<()> {
		if let Some(rec) = self.inner.lock().await.accounts.get_mut(account) {
			rec.cursor = rec.cursor.max(cursor);
		}
		Ok(())
	}

	async fn update_roster_set(&self, account: &AccountId, roster_set: bool) -> anyhow::Result<()> {
		if let Some(rec) = self.inner.lock().await.accounts.get_mut(account) {
			rec.roster_set = roster_set;
		}
		Ok(())
	}

	async fn delete_account(&self, account: &AccountId) -> anyhow::Result<bool> {
		let mut guard = self.inner.lock().await;
		guard.rooms.retain(|_, r| &r.account != account);
		Ok(guard.accounts.remove(account).is_some())
	}

	async fn account(&self, account: &AccountId) -> anyhow::Result<Option<AccountRecord>> {
		Ok(self.inner.lock().await.accounts.get(account).cloned())
	}

	async fn accounts(&self) -> anyhow::Result<Vec<AccountRecord>> {
		let mut out: Vec<_> = self.inner.lock().await.accounts.values().cloned().collect();
		out.sort_by(|a, b| a.account.cmp(&b.account));
		Ok(out)
	}

	async fn count(&self) -> anyhow::Result<u64> {
		Ok(self.inner.lock().await.accounts.len() as u64)
	}

	async fn upsert_room(&self, record: &RoomRecord) -> anyhow::Result<()> {
		self.inner.lock().await.rooms.insert(record.room.clone(), record.clone());
		Ok(())
	}

	async fn room(&self, room: &RoomJid) -> anyhow::Result<Option<RoomRecord>> {
		Ok(self.inner.lock().await.rooms.get(room).cloned())
	}

	async fn update_room_owner(&self, room: &RoomJid, owner_id: &str) -> anyhow::Result<()> {
		if let Some(rec) = self.inner.lock().await.rooms.get_mut(room) {
			rec.owner_id = Some(owner_id.to_string());
		}
		Ok(())
	}

	async fn update_room_nickname(&self, room: &RoomJid, nickname: &str) -> anyhow::Result<()> {
		if let Some(rec) = self.inner.lock().await.rooms.get_mut(room) {
			rec.owner_nickname = Some(nickname.to_string());
		}
		Ok(())
	}

	async fn delete_room(&self, room: &RoomJid) -> anyhow::Result<()> {
		self.inner.lock().await.rooms.remove(room);
		Ok(())
	}
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

type AccountRow = (String, Option<String>, String, i64, bool);
type RoomRow = (String, String, Option<String>, Option<String>);

fn account_from_row(row: AccountRow) -> anyhow::Result<AccountRecord> {
	let (account, display_name, token, cursor, roster_set) = row;
	Ok(AccountRecord {
		account: AccountId::new(&account).with_context(|| format!("stored account id {account:?}"))?,
		display_name,
		token: SecretString::new(token),
		cursor,
		roster_set,
	})
}

fn room_from_row(row: RoomRow) -> anyhow::Result<RoomRecord> {
	let (room, account, owner_id, owner_nickname) = row;
	Ok(RoomRecord {
		room: RoomJid::new(&room).with_context(|| format!("stored room id {room:?}"))?,
		account: AccountId::new(&account).with_context(|| format!("stored room account {account:?}"))?,
		owner_id,
		owner_nickname,
	})
}

/// sqlx-backed store (sqlite or postgres).
#[derive(Clone)]
pub struct SqlStore {
	backend: SqlBackend,
}

impl SqlStore {
	pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let options = database_url
				.parse::<sqlx::sqlite::SqliteConnectOptions>()
				.context("parse sqlite url")?
				.create_if_missing(true);
			let pool = sqlx::sqlite::SqlitePoolOptions::new()
				.max_connections(max_connections)
				.connect_with(options)
				.await
				.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::postgres::PgPoolOptions::new()
				.max_connections(max_connections)
				.connect(database_url)
				.await
				.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}
}

#[async_trait::async_trait]
impl AccountStore for SqlStore {
	async fn upsert_account(&self, record: &AccountRecord) -> anyhow::Result<()> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO accounts (account_id, display_name, token, cursor, roster_set) VALUES (?, ?, ?, ?, ?) \
					ON CONFLICT(account_id) DO UPDATE SET token = excluded.token, display_name = excluded.display_name",
				)
				.bind(record.account.as_str())
				.bind(record.display_name.as_deref())
				.bind(record.token.expose())
				.bind(record.cursor)
				.bind(record.roster_set)
				.execute(pool)
				.await
				.context("upsert account (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO accounts (account_id, display_name, token, cursor, roster_set) VALUES ($1, $2, $3, $4, $5) \
					ON CONFLICT(account_id) DO UPDATE SET token = excluded.token, display_name = excluded.display_name",
				)
				.bind(record.account.as_str())
				.bind(record.display_name.as_deref())
				.bind(record.token.expose())
				.bind(record.cursor)
				.bind(record.roster_set)
				.execute(pool)
				.await
				.context("upsert account (postgres)")?;
			}
		}
		Ok(())
	}

	async fn update_token(&self, account: &AccountId, token: &SecretString) -> anyhow::Result<()> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("UPDATE accounts SET token = ? WHERE account_id = ?")
					.bind(token.expose())
					.bind(account.as_str())
					.execute(pool)
					.await
					.context("update token (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("UPDATE accounts SET token = $1 WHERE account_id = $2")
					.bind(token.expose())
					.bind(account.as_str())
					.execute(pool)
					.await
					.context("update token (postgres)")?;
			}
		}
		Ok(())
	}

	async fn update_display_name(&self, account: &AccountId, name: &str) -> anyhow::Result<()> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("UPDATE accounts SET display_name = ? WHERE account_id = ?")
					.bind(name)
					.bind(account.as_str())
					.execute(pool)
					.await
					.context("update display name (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("UPDATE accounts SET display_name = $1 WHERE account_id = $2")
					.bind(name)
					.bind(account.as_str())
					.execute(pool)
					.await
					.context("update display name (postgres)")?;
			}
		}
		Ok(())
	}

	async fn update_cursor(&self, account: &AccountId, cursor: i64) -> anyhow::Result<()> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("UPDATE accounts SET cursor = ? WHERE account_id = ? AND cursor < ?")
					.bind(cursor)
					.bind(account.as_str())
					.bind(cursor)
					.execute(pool)
					.await
					.context("update cursor (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("UPDATE accounts SET cursor = $1 WHERE account_id = $2 AND cursor < $1")
					.bind(cursor)
					.bind(account.as_str())
					.execute(pool)
					.await
					.context("update cursor (postgres)")?;
			}
		}
		Ok(())
	}

	async fn update_roster_set(&self, account: &AccountId, roster_set: bool) -> anyhow::Result<()> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("UPDATE accounts SET roster_set = ? WHERE account_id = ?")
					.bind(roster_set)
					.bind(account.as_str())
					.execute(pool)
					.await
					.context("update roster flag (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("UPDATE accounts SET roster_set = $1 WHERE account_id = $2")
					.bind(roster_set)
					.bind(account.as_str())
					.execute(pool)
					.await
					.context("update roster flag (postgres)")?;
			}
		}
		Ok(())
	}

	async fn delete_account(&self, account: &AccountId) -> anyhow::Result<bool> {
		let deleted = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;
				sqlx::query("DELETE FROM rooms WHERE account_id = ?")
					.bind(account.as_str())
					.execute(&mut *tx)
					.await
					.context("delete rooms (sqlite)")?;
				let res = sqlx::query("DELETE FROM accounts WHERE account_id = ?")
					.bind(account.as_str())
					.execute(&mut *tx)
					.await
					.context("delete account (sqlite)")?;
				tx.commit().await.context("commit sqlite tx")?;
				res.rows_affected()
			}
			SqlBackend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;
				sqlx::query("DELETE FROM rooms WHERE account_id = $1")
					.bind(account.as_str())
					.execute(&mut *tx)
					.await
					.context("delete rooms (postgres)")?;
				let res = sqlx::query("DELETE FROM accounts WHERE account_id = $1")
					.bind(account.as_str())
					.execute(&mut *tx)
					.await
					.context("delete account (postgres)")?;
				tx.commit().await.context("commit postgres tx")?;
				res.rows_affected()
			}
		};
		Ok(deleted > 0)
	}

	async fn account(&self, account: &AccountId) -> anyhow::Result<Option<AccountRecord>> {
		let row: Option<AccountRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(
				"SELECT account_id, display_name, token, cursor, roster_set FROM accounts WHERE account_id = ?",
			)
			.bind(account.as_str())
			.fetch_optional(pool)
			.await
			.context("select account (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(
				"SELECT account_id, display_name, token, cursor, roster_set FROM accounts WHERE account_id = $1",
			)
			.bind(account.as_str())
			.fetch_optional(pool)
			.await
			.context("select account (postgres)")?,
		};
		row.map(account_from_row).transpose()
	}

	async fn accounts(&self) -> anyhow::Result<Vec<AccountRecord>> {
		let sql = "SELECT account_id, display_name, token, cursor, roster_set FROM accounts ORDER BY account_id";
		let rows: Vec<AccountRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(sql)
				.fetch_all(pool)
				.await
				.context("select accounts (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(sql)
				.fetch_all(pool)
				.await
				.context("select accounts (postgres)")?,
		};
		rows.into_iter().map(account_from_row).collect()
	}

	async fn count(&self) -> anyhow::Result<u64> {
		let sql = "SELECT COUNT(*) FROM accounts";
		let (n,): (i64,) = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(sql)
				.fetch_one(pool)
				.await
				.context("count accounts (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(sql)
				.fetch_one(pool)
				.await
				.context("count accounts (postgres)")?,
		};
		Ok(n.max(0) as u64)
	}

	async fn upsert_room(&self, record: &RoomRecord) -> anyhow::Result<()> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO rooms (room_id, account_id, owner_id, owner_nickname) VALUES (?, ?, ?, ?) \
					ON CONFLICT(room_id) DO UPDATE SET account_id = excluded.account_id",
				)
				.bind(record.room.as_str())
				.bind(record.account.as_str())
				.bind(record.owner_id.as_deref())
				.bind(record.owner_nickname.as_deref())
				.execute(pool)
				.await
				.context("upsert room (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO rooms (room_id, account_id, owner_id, owner_nickname) VALUES ($1, $2, $3, $4) \
					ON CONFLICT(room_id) DO UPDATE SET account_id = excluded.account_id",
				)
				.bind(record.room.as_str())
				.bind(record.account.as_str())
				.bind(record.owner_id.as_deref())
				.bind(record.owner_nickname.as_deref())
				.execute(pool)
				.await
				.context("upsert room (postgres)")?;
			}
		}
		Ok(())
	}

	async fn room(&self, room: &RoomJid) -> anyhow::Result<Option<RoomRecord>> {
		let row: Option<RoomRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query_as("SELECT room_id, account_id, owner_id, owner_nickname FROM rooms WHERE room_id = ?")
					.bind(room.as_str())
					.fetch_optional(pool)
					.await
					.context("select room (sqlite)")?
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query_as("SELECT room_id, account_id, owner_id, owner_nickname FROM rooms WHERE room_id = $1")
					.bind(room.as_str())
					.fetch_optional(pool)
					.await
					.context("select room (postgres)")?
			}
		};
		row.map(room_from_row).transpose()
	}

	async fn update_room_owner(&self, room: &RoomJid, owner_id: &str) -> anyhow::Result<()> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("UPDATE rooms SET owner_id = ? WHERE room_id = ?")
					.bind(owner_id)
					.bind(room.as_str())
					.execute(pool)
					.await
					.context("update room owner (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("UPDATE rooms SET owner_id = $1 WHERE room_id = $2")
					.bind(owner_id)
					.bind(room.as_str())
					.execute(pool)
					.await
					.context("update room owner (postgres)")?;
			}
		}
		Ok(())
	}

	async fn update_room_nickname(&self, room: &RoomJid, nickname: &str) -> anyhow::Result<()> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("UPDATE rooms SET owner_nickname = ? WHERE room_id = ?")
					.bind(nickname)
					.bind(room.as_str())
					.execute(pool)
					.await
					.context("update room nickname (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("UPDATE rooms SET owner_nickname = $1 WHERE room_id = $2")
					.bind(nickname)
					.bind(room.as_str())
					.execute(pool)
					.await
					.context("update room nickname (postgres)")?;
			}
		}
		Ok(())
	}

	async fn delete_room(&self, room: &RoomJid) -> anyhow::Result<()> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("DELETE FROM rooms WHERE room_id = ?")
					.bind(room.as_str())
					.execute(pool)
					.await
					.context("delete room (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("DELETE FROM rooms WHERE room_id = $1")
					.bind(room.as_str())
					.execute(pool)
					.await
					.context("delete room (postgres)")?;
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn account(s: &str) -> AccountId {
		AccountId::new(s).unwrap()
	}

	async fn sqlite() -> SqlStore {
		SqlStore::connect("sqlite::memory:", 1).await.unwrap()
	}

	fn room_record(room: &RoomJid, account: &AccountId) -> RoomRecord {
		RoomRecord {
			room: room.clone(),
			account: account.clone(),
			owner_id: None,
			owner_nickname: None,
		}
	}

	#[tokio::test]
	async fn sqlite_account_record_survives_updates() {
		let store = sqlite().await;
		let alice = account("alice@example.org");
		let mut record = AccountRecord::new(alice.clone(), SecretString::new("t1"));
		record.display_name = Some("Alice A".to_string());
		store.upsert_account(&record).await.unwrap();

		store.update_cursor(&alice, 40).await.unwrap();
		store.update_cursor(&alice, 12).await.unwrap();
		store.update_roster_set(&alice, true).await.unwrap();
		store.update_token(&alice, &SecretString::new("t2")).await.unwrap();
		store.update_display_name(&alice, "Alice B").await.unwrap();

		let rec = store.account(&alice).await.unwrap().unwrap();
		assert_eq!(rec.token.expose(), "t2");
		assert_eq!(rec.cursor, 40, "cursor only moves forward");
		assert!(rec.roster_set);
		assert_eq!(rec.display_name.as_deref(), Some("Alice B"));

		store
			.upsert_account(&AccountRecord::new(alice.clone(), SecretString::new("t3")))
			.await
			.unwrap();
		let rec = store.account(&alice).await.unwrap().unwrap();
		assert_eq!(rec.token.expose(), "t3");
		assert_eq!(rec.cursor, 40);
		assert!(rec.roster_set);

		assert!(store.account(&account("bob@example.org")).await.unwrap().is_none());
		assert_eq!(store.count().await.unwrap(), 1);
		assert_eq!(store.accounts().await.unwrap(), vec![rec]);
	}

	#[tokio::test]
	async fn sqlite_unlink_removes_account_and_rooms() {
		let store = sqlite().await;
		let alice = account("alice@example.org");
		let bob = account("bob@example.org");
		for id in [&alice, &bob] {
			store
				.upsert_account(&AccountRecord::new(id.clone(), SecretString::new("t")))
				.await
				.unwrap();
		}
		let room = RoomJid::new("chat1_alice@conference.example.org").unwrap();
		let other = RoomJid::new("chat1_bob@conference.example.org").unwrap();
		store.upsert_room(&room_record(&room, &alice)).await.unwrap();
		store.upsert_room(&room_record(&other, &bob)).await.unwrap();
		store.update_room_owner(&room, "carol@example.org").await.unwrap();
		store.update_room_nickname(&room, "al").await.unwrap();

		let rec = store.room(&room).await.unwrap().unwrap();
		assert_eq!(rec.account, alice);
		assert_eq!(rec.owner_id.as_deref(), Some("carol@example.org"));
		assert_eq!(rec.owner_nickname.as_deref(), Some("al"));

		// re-creating the room keeps what was learned about its owner
		store.upsert_room(&room_record(&room, &alice)).await.unwrap();
		assert_eq!(
			store.room(&room).await.unwrap().unwrap().owner_nickname.as_deref(),
			Some("al")
		);

		assert!(store.delete_account(&alice).await.unwrap());
		assert!(!store.delete_account(&alice).await.unwrap());
		assert!(store.account(&alice).await.unwrap().is_none());
		assert!(store.room(&room).await.unwrap().is_none());
		assert!(store.room(&other).await.unwrap().is_some());
		assert_eq!(store.count().await.unwrap(), 1);

		store.delete_room(&other).await.unwrap();
		assert!(store.room(&other).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn unsupported_database_url_is_rejected() {
		let err = SqlStore::connect("mysql://localhost/vk", 1).await.err().unwrap();
		assert!(err.to_string().contains("unsupported database_url"), "{err}");
	}

	#[tokio::test]
	async fn upsert_keeps_cursor_and_roster_flag() {
		let store = InMemoryStore::default();
		let alice = account("alice@example.org");
		store
			.upsert_account(&AccountRecord::new(alice.clone(), SecretString::new("t1")))
			.await
			.unwrap();
		store.update_cursor(&alice, 40).await.unwrap();
		store.update_roster_set(&alice, true).await.unwrap();

		store
			.upsert_account(&AccountRecord::new(alice.clone(), SecretString::new("t2")))
			.await
			.unwrap();
		let rec = store.account(&alice).await.unwrap().unwrap();
		assert_eq!(rec.token.expose(), "t2");
		assert_eq!(rec.cursor, 40);
		assert!(rec.roster_set);
	}

	#[tokio::test]
	async fn cursor_never_moves_back() {
		let store = InMemoryStore::default();
		let alice = account("alice@example.org");
		store
			.upsert_account(&AccountRecord::new(alice.clone(), SecretString::new("t")))
			.await
			.unwrap();
		store.update_cursor(&alice, 10).await.unwrap();
		store.update_cursor(&alice, 3).await.unwrap();
		assert_eq!(store.account(&alice).await.unwrap().unwrap().cursor, 10);
	}

	#[tokio::test]
	async fn delete_account_drops_rooms() {
		let store = InMemoryStore::default();
		let alice = account("alice@example.org");
		store
			.upsert_account(&AccountRecord::new(alice.clone(), SecretString::new("t")))
			.await
			.unwrap();
		let room = RoomJid::new("chat1_alice@conference.example.org").unwrap();
		store
			.upsert_room(&RoomRecord {
				room: room.clone(),
				account: alice.clone(),
				owner_id: None,
				owner_nickname: None,
			})
			.await
			.unwrap();
		store.update_room_nickname(&room, "al").await.unwrap();
		assert_eq!(
			store.room(&room).await.unwrap().unwrap().owner_nickname.as_deref(),
			Some("al")
		);

		assert!(store.delete_account(&alice).await.unwrap());
		assert!(!store.delete_account(&alice).await.unwrap());
		assert!(store.room(&room).await.unwrap().is_none());
		assert_eq!(store.count().await.unwrap(), 0);
	}
}
