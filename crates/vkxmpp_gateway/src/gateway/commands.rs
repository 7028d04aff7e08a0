#![forbid(unsafe_code)]

use std::sync::Arc;

use tracing::{info, warn};
use vkxmpp_domain::AccountId;
use vkxmpp_remote::{ApiError, SecretString};

use super::Gateway;
use crate::store::AccountRecord;
use crate::sync::SyncError;

pub const HELP: &str = "Commands:\n\
!link <token> - link your remote account\n\
!unlink - forget your account\n\
!captcha <text> - answer a pending captcha\n\
!set [<name> on|off] - show or change preserve_timestamps and keep_online";

/// A text command sent to the gateway JID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
	Link(String),
	Unlink,
	Captcha(String),
	Set(Option<(String, bool)>),
	Help,
}

impl Command {
	pub fn parse(body: &str) -> Self {
		let body = body.trim();
		let (name, rest) = body.split_once(char::is_whitespace).unwrap_or((body, ""));
		let rest = rest.trim();
		match name.to_ascii_lowercase().as_str() {
			"!link" if !rest.is_empty() => Self::Link(rest.to_string()),
			"!unlink" => Self::Unlink,
			"!captcha" if !rest.is_empty() => Self::Captcha(rest.to_string()),
			"!set" if rest.is_empty() => Self::Set(None),
			"!set" => {
				let mut words = rest.split_whitespace();
				let setting = words.next().unwrap_or_default().to_ascii_lowercase();
				match words.next().map(str::to_ascii_lowercase).as_deref() {
					Some("on" | "1" | "true" | "yes") => Self::Set(Some((setting, true))),
					Some("off" | "0" | "false" | "no") => Self::Set(Some((setting, false))),
					_ => Self::Help,
				}
			}
			_ => Self::Help,
		}
	}
}

pub(super) async fn execute(gw: &Arc<Gateway>, account: &AccountId, command: Command) -> Result<(), SyncError> {
	match command {
		Command::Link(token) => link(gw, account, SecretString::new(token)).await,
		Command::Unlink => {
			if !gw.unlink(account, false).await? {
				gw.notice(account, "You have no linked account.").await?;
			} else {
				gw.notice(account, "Your account was unlinked.").await?;
			}
			Ok(())
		}
		Command::Captcha(key) => captcha(gw, account, &key).await,
		Command::Set(change) => {
			let Some(session) = gw.session(account) else {
				gw.notice(account, "You are not logged in.").await?;
				return Ok(());
			};
			let reply = match change {
				None => session.settings.describe(),
				Some((name, value)) if session.settings.set(&name, value) => {
					format!("Updated. {}", session.settings.describe())
				}
				Some((name, _)) => format!("Unknown setting: {name}"),
			};
			gw.notice(account, reply).await?;
			Ok(())
		}
		Command::Help => {
			gw.notice(account, HELP).await?;
			Ok(())
		}
	}
}

async fn link(gw: &Arc<Gateway>, account: &AccountId, token: SecretString) -> Result<(), SyncError> {
	let store = &gw.ctx.store;
	let existing = match store.account(account).await {
		Ok(existing) => existing,
		Err(e) => {
			warn!(account = %account, error = %e, "account lookup failed");
			gw.notice(account, "Linking failed, try again later.").await?;
			return Ok(());
		}
	};
	let saved = match &existing {
		Some(_) => store.update_token(account, &token).await,
		None => store.upsert_account(&AccountRecord::new(account.clone(), token)).await,
	};
	if let Err(e) = saved {
		warn!(account = %account, error = %e, "failed to store account");
		gw.notice(account, "Linking failed, try again later.").await?;
		return Ok(());
	}
	if let Ok(total) = store.count().await {
		gw.ctx.stats.set_accounts_total(total);
	}
	info!(account = %account, relink = existing.is_some(), "account linked");

	if let Some(session) = gw.sessions.write().remove(account) {
		session.stop();
	}
	if let Some(session) = gw.login(account, None).await? {
		let state = if session.client.is_frozen() {
			"Account linked. Solve the captcha to finish logging in."
		} else {
			"Account linked."
		};
		gw.notice(account, state).await?;
	}
	Ok(())
}

async fn captcha(gw: &Arc<Gateway>, account: &AccountId, key: &str) -> Result<(), SyncError> {
	let Some(session) = gw.session(account).filter(|s| s.client.is_frozen()) else {
		gw.notice(account, "No captcha is pending.").await?;
		return Ok(());
	};
	match session.client.solve_captcha(key).await {
		Ok(()) => {
			gw.notice(account, "Captcha accepted.").await?;
			if let Err(e) = gw.initialize(&session).await {
				gw.on_sync_error(&session, "messages.get", e).await;
			}
		}
		Err(ApiError::CaptchaNeeded { .. }) => {
			gw.notice(account, "Wrong captcha.").await?;
			gw.send_captcha_challenge(&session).await?;
		}
		Err(e) => gw.handle_api_error(&session, "captcha", e).await,
	}
	Ok(())
}
