#![forbid(unsafe_code)]

use std::sync::Arc;

use tracing::{debug, info};
use vkxmpp_remote::longpoll::backoff_delay;
use vkxmpp_remote::{PollStep, Poller};

use super::Gateway;
use crate::session::Session;

/// Long-poll loop of one session. Exits when the session stops or the gateway dies.
pub(super) async fn run(gateway: Arc<Gateway>, session: Arc<Session>) {
	let remote = &gateway.remote;
	let mut poller = Poller::new(Arc::clone(&session.client), remote.poll_wait_secs, remote.poll_margin);
	let mut attempt: u32 = 0;
	info!(account = %session.account, "poll worker started");

	while gateway.is_alive() && !session.is_stopped() {
		let step = tokio::select! {
			_ = session.stopped() => break,
			step = poller.step() => step,
		};

		let failed = match step {
			PollStep::Events(events) => {
				attempt = 0;
				metrics::counter!("vkxmpp_poll_events_total").increment(events.len() as u64);
				gateway.dispatch_events(&session, events).await;
				false
			}
			PollStep::Retry => false,
			PollStep::Reinit => true,
			PollStep::Frozen => {
				debug!(account = %session.account, "polling paused until the captcha is solved");
				tokio::select! {
					_ = session.stopped() => break,
					_ = session.client.wait_until_unfrozen() => {}
				}
				false
			}
			PollStep::Failed(e) => {
				gateway
					.handle_api_error(&session, "messages.getLongPollServer", e)
					.await;
				true
			}
		};

		if failed {
			let delay = backoff_delay(attempt, remote.reconnect_min_delay, remote.reconnect_max_delay);
			attempt = attempt.saturating_add(1);
			metrics::counter!("vkxmpp_poll_reinit_total").increment(1);
			debug!(account = %session.account, attempt, delay_ms = delay.as_millis() as u64, "long-poll reinit");
			tokio::select! {
				_ = session.stopped() => break,
				_ = tokio::time::sleep(delay) => {}
			}
		}
	}
	info!(account = %session.account, "poll worker stopped");
}
