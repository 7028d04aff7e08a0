#![forbid(unsafe_code)]

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use url::Url;

use crate::RemoteTransport;
use crate::error::{ApiError, decode_envelope};

pub const DEFAULT_API_BASE_URL: &str = "https://api.vk.com/method/";

async fn send_with_retry(req: reqwest::RequestBuilder, label: &str) -> Result<reqwest::Response, ApiError> {
	let retry_builder = req.try_clone();
	let resp = req
		.send()
		.await
		.map_err(|e| ApiError::NetworkUnavailable(format!("{label} send: {e}")))?;

	if resp.status().is_server_error()
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(Duration::from_millis(250)).await;
		return retry
			.send()
			.await
			.map_err(|e| ApiError::NetworkUnavailable(format!("{label} retry send: {e}")));
	}

	Ok(resp)
}

/// `reqwest` transport for the public API and its long-poll servers.
#[derive(Debug, Clone)]
pub struct HttpTransport {
	http: reqwest::Client,
	base_url: Url,
}

impl HttpTransport {
	pub fn new(base_url: &str) -> anyhow::Result<Self> {
		let mut base = base_url.trim().to_string();
		if !base.ends_with('/') {
			base.push('/');
		}
		let base_url = Url::parse(&base).map_err(|e| anyhow::anyhow!("invalid api base url {base}: {e}"))?;
		let http = reqwest::Client::builder()
			.user_agent(concat!("vkxmpp/", env!("CARGO_PKG_VERSION")))
			.connect_timeout(Duration::from_secs(10))
			.build()?;
		Ok(Self { http, base_url })
	}
}

#[async_trait]
impl RemoteTransport for HttpTransport {
	async fn call(&self, method: &str, params: &[(String, String)]) -> Result<serde_json::Value, ApiError> {
		let url = self
			.base_url
			.join(method)
			.map_err(|e| ApiError::Malformed(format!("{method}: {e}")))?;

		let resp = send_with_retry(self.http.post(url).form(params).timeout(Duration::from_secs(30)), method).await?;
		let status = resp.status();
		let body = resp
			.text()
			.await
			.map_err(|e| ApiError::NetworkUnavailable(format!("{method} read body: {e}")))?;

		if status.is_server_error() {
			return Err(ApiError::ServerError(format!("{method}: status={status}")));
		}
		if status != StatusCode::OK {
			return Err(ApiError::Unknown {
				code: i64::from(status.as_u16()),
				message: format!("{method}: unexpected status"),
			});
		}

		let envelope: serde_json::Value =
			serde_json::from_str(&body).map_err(|e| ApiError::Malformed(format!("{method}: {e}")))?;
		decode_envelope(envelope)
	}

	async fn poll(&self, url: &Url, timeout: Duration) -> Result<String, ApiError> {
		let resp = self
			.http
			.get(url.clone())
			.timeout(timeout)
			.send()
			.await
			.map_err(|e| ApiError::NetworkUnavailable(format!("long-poll: {e}")))?;
		resp.text()
			.await
			.map_err(|e| ApiError::NetworkUnavailable(format!("long-poll read body: {e}")))
	}
}
