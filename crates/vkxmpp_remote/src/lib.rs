#![forbid(unsafe_code)]

pub mod client;
pub mod error;
pub mod http;
pub mod longpoll;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

pub use client::{CallOptions, CaptchaInfo, Friend, RemoteClient, RemoteMessage};
pub use error::{ApiError, ErrorPolicy};
pub use http::HttpTransport;
pub use longpoll::{PollDescriptor, PollEvent, PollOutcome, PollState, PollStep, Poller};

/// Wire access to the remote service. The client owns policy; transports only move bytes.
#[async_trait]
pub trait RemoteTransport: Send + Sync + 'static {
	/// Invoke an API method and return the unwrapped `response` value.
	async fn call(&self, method: &str, params: &[(String, String)]) -> Result<serde_json::Value, ApiError>;

	/// Read one long-poll payload. Transport failures map to `ApiError::NetworkUnavailable`.
	async fn poll(&self, url: &Url, timeout: Duration) -> Result<String, ApiError>;
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod client_tests;
