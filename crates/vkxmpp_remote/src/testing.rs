#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use url::Url;

use crate::{ApiError, RemoteClient, RemoteTransport, SecretString};

/// Scripted transport. Unscripted methods answer `1`; an empty poll script reports a network error.
#[derive(Default)]
pub(crate) struct FakeTransport {
	replies: Mutex<HashMap<String, VecDeque<Result<Value, ApiError>>>>,
	polls: Mutex<VecDeque<Result<String, ApiError>>>,
	pub(crate) calls: Mutex<Vec<(String, Vec<(String, String)>)>>,
	pub(crate) poll_urls: Mutex<Vec<Url>>,
}

impl FakeTransport {
	pub(crate) fn reply(&self, method: &str, result: Result<Value, ApiError>) {
		self.replies.lock().entry(method.to_string()).or_default().push_back(result);
	}

	pub(crate) fn push_poll(&self, body: Result<String, ApiError>) {
		self.polls.lock().push_back(body);
	}

	pub(crate) fn methods(&self) -> Vec<String> {
		self.calls.lock().iter().map(|(m, _)| m.clone()).collect()
	}
}

#[async_trait]
impl RemoteTransport for FakeTransport {
	async fn call(&self, method: &str, params: &[(String, String)]) -> Result<Value, ApiError> {
		self.calls.lock().push((method.to_string(), params.to_vec()));
		let scripted = self.replies.lock().get_mut(method).and_then(VecDeque::pop_front);
		scripted.unwrap_or_else(|| Ok(json!(1)))
	}

	async fn poll(&self, url: &Url, _timeout: Duration) -> Result<String, ApiError> {
		self.poll_urls.lock().push(url.clone());
		let next = self.polls.lock().pop_front();
		next.unwrap_or_else(|| Err(ApiError::NetworkUnavailable("script exhausted".to_string())))
	}
}

pub(crate) fn client(transport: &Arc<FakeTransport>) -> Arc<RemoteClient> {
	let t: Arc<dyn RemoteTransport> = transport.clone();
	Arc::new(RemoteClient::new(t, "alice@example.org", SecretString::new("tok"), "5.81"))
}

pub(crate) fn captcha_error() -> ApiError {
	ApiError::CaptchaNeeded {
		image: "https://example.org/captcha.png".to_string(),
		sid: "77".to_string(),
	}
}
