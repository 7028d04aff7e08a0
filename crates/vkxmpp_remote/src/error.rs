#![forbid(unsafe_code)]

use serde::Deserialize;
use thiserror::Error;

/// Classified outcome of a failed remote call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApiError {
	#[error("captcha needed (sid={sid})")]
	CaptchaNeeded { image: String, sid: String },
	#[error("token invalid: {0}")]
	TokenInvalid(String),
	#[error("network unavailable: {0}")]
	NetworkUnavailable(String),
	#[error("permission denied: {0}")]
	PermissionDenied(String),
	#[error("validation required: {0}")]
	ValidationRequired(String),
	#[error("server error: {0}")]
	ServerError(String),
	#[error("api error {code}: {message}")]
	Unknown { code: i64, message: String },
	#[error("malformed response: {0}")]
	Malformed(String),
}

/// What the gateway should do about an `ApiError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
	/// Freeze calls and polling; send the challenge to the owner.
	Freeze,
	/// Notify the owner, delete the account record, stop the session.
	Unlink,
	/// Tell the sender their message was refused.
	NotifySender,
	/// Transient; the next poll/refresh tries again.
	Retry,
	/// Log and mark the client offline.
	MarkOffline,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
	error_code: i64,
	#[serde(default)]
	error_msg: String,
	#[serde(default)]
	captcha_sid: Option<serde_json::Value>,
	#[serde(default)]
	captcha_img: Option<String>,
}

impl ApiError {
	/// Map a numeric service error code onto the taxonomy.
	pub fn from_code(code: i64, message: impl Into<String>) -> Self {
		let message = message.into();
		match code {
			5 => Self::TokenInvalid(message),
			6 | 9 | 10 => Self::ServerError(message),
			7 | 15 | 902 => Self::PermissionDenied(message),
			17 => Self::ValidationRequired(message),
			_ => Self::Unknown { code, message },
		}
	}

	pub fn policy(&self, method: &str) -> ErrorPolicy {
		match self {
			Self::CaptchaNeeded { .. } => ErrorPolicy::Freeze,
			Self::TokenInvalid(_) => ErrorPolicy::Unlink,
			Self::PermissionDenied(_) if method == "messages.send" => ErrorPolicy::NotifySender,
			Self::NetworkUnavailable(_) | Self::ServerError(_) | Self::Malformed(_) => ErrorPolicy::Retry,
			Self::PermissionDenied(_) | Self::ValidationRequired(_) | Self::Unknown { .. } => ErrorPolicy::MarkOffline,
		}
	}

	/// Whether this error takes the client offline.
	pub fn marks_offline(&self) -> bool {
		matches!(
			self,
			Self::CaptchaNeeded { .. } | Self::NetworkUnavailable(_) | Self::Unknown { .. } | Self::ValidationRequired(_)
		)
	}
}

/// Unwrap a `{"response": ...}` / `{"error": {...}}` envelope.
pub fn decode_envelope(mut envelope: serde_json::Value) -> Result<serde_json::Value, ApiError> {
	if let Some(err) = envelope.get_mut("error").map(serde_json::Value::take) {
		let body: ErrorBody = serde_json::from_value(err).map_err(|e| ApiError::Malformed(e.to_string()))?;
		if body.error_code == 14 {
			let sid = match body.captcha_sid {
				Some(serde_json::Value::String(s)) => s,
				Some(v) => v.to_string(),
				None => String::new(),
			};
			return Err(ApiError::CaptchaNeeded {
				image: body.captcha_img.unwrap_or_default(),
				sid,
			});
		}
		return Err(ApiError::from_code(body.error_code, body.error_msg));
	}

	match envelope.get_mut("response") {
		Some(v) => Ok(v.take()),
		None => Err(ApiError::Malformed("missing response field".to_string())),
	}
}
