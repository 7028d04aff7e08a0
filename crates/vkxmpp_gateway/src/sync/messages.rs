#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use vkxmpp_remote::RemoteMessage;

use super::SyncError;
use crate::context::Context;
use crate::session::Session;
use crate::text::{escape, unescape_html};
use crate::xmpp::Message;

/// Upper bound of one `messages.get` pull.
pub const PULL_BATCH: u32 = 200;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
	/// Append to the delivered body and keep going.
	Append(String),
	/// The handler delivered the message itself; stop the chain.
	Handled,
}

/// One link of the incoming-message chain.
#[async_trait]
pub trait MessageHandler: Send + Sync {
	fn name(&self) -> &'static str;

	async fn handle(&self, session: &Session, message: &RemoteMessage) -> anyhow::Result<HandlerOutcome>;
}

/// Marks messages whose attachments are not rendered.
pub struct AttachmentHint;

#[async_trait]
impl MessageHandler for AttachmentHint {
	fn name(&self) -> &'static str {
		"attachments"
	}

	async fn handle(&self, _session: &Session, message: &RemoteMessage) -> anyhow::Result<HandlerOutcome> {
		if !message.has_attachments {
			return Ok(HandlerOutcome::Append(String::new()));
		}
		let sep = if message.body.is_empty() { "" } else { "\n" };
		Ok(HandlerOutcome::Append(format!("{sep}[attachment]")))
	}
}

/// Delivers remote messages to the owner in id order and advances the cursor.
pub struct MessageSync {
	handlers: Vec<Arc<dyn MessageHandler>>,
}

impl MessageSync {
	pub fn new(handlers: Vec<Arc<dyn MessageHandler>>) -> Self {
		Self { handlers }
	}

	pub fn handler_names(&self) -> Vec<&'static str> {
		self.handlers.iter().map(|h| h.name()).collect()
	}

	/// Deliver `batch`, or pull unseen messages when `batch` is `None`. Returns the number delivered.
	pub async fn sync(
		&self,
		ctx: &Context,
		session: &Session,
		initial: bool,
		batch: Option<Vec<RemoteMessage>>,
	) -> Result<usize, SyncError> {
		let mut cursor = session.cursor.lock().await;

		let mut messages = match batch {
			Some(batch) => batch,
			None => match session.client.messages(PULL_BATCH, *cursor).await? {
				Some(pulled) => pulled,
				None => return Ok(0),
			},
		};
		messages.sort_by_key(|m| m.id);

		let with_date = initial || session.settings.preserve_timestamps();
		let mut newest = *cursor;
		let mut delivered = 0;
		for message in &messages {
			if message.id <= newest {
				continue;
			}
			newest = newest.max(message.id);
			if message.out {
				continue;
			}
			ctx.stats.incoming();

			let Some(body) = self.run_chain(session, message).await else {
				continue;
			};
			let mut stanza = Message::chat(ctx.jids.contact(message.from), session.account.as_str(), escape(&body));
			if with_date {
				stanza = stanza.with_timestamp(message.date);
			}
			ctx.send(stanza).await?;
			delivered += 1;
		}

		if newest > *cursor {
			*cursor = newest;
			if let Err(e) = ctx.store.update_cursor(&session.account, newest).await {
				warn!(account = %session.account, error = %e, "failed to persist message cursor");
			}
		}
		debug!(account = %session.account, delivered, cursor = *cursor, "message sync done");
		Ok(delivered)
	}

	async fn run_chain(&self, session: &Session, message: &RemoteMessage) -> Option<String> {
		let mut body = unescape_html(&message.body);
		for handler in &self.handlers {
			match handler.handle(session, message).await {
				Ok(HandlerOutcome::Append(fragment)) => body.push_str(&fragment),
				Ok(HandlerOutcome::Handled) => {
					debug!(handler = handler.name(), message_id = message.id, "message claimed by handler");
					return None;
				}
				Err(e) => {
					warn!(
						handler = handler.name(),
						account = %session.account,
						message_id = message.id,
						error = %e,
						"message handler failed"
					);
					metrics::counter!("vkxmpp_handler_failures_total").increment(1);
				}
			}
		}
		Some(body)
	}
}
