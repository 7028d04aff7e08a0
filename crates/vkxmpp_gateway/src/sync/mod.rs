#![forbid(unsafe_code)]

pub mod messages;
pub mod presence;

use thiserror::Error;
use vkxmpp_remote::ApiError;

use crate::xmpp::OutboundError;

/// Why a sync pass stopped early.
#[derive(Debug, Error)]
pub enum SyncError {
	#[error(transparent)]
	Api(#[from] ApiError),
	#[error(transparent)]
	Outbound(#[from] OutboundError),
}
