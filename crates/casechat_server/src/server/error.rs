#![forbid(unsafe_code)]

use casechat_directory::DirectoryError;
use casechat_protocol::wire::ErrorCode;
use thiserror::Error;

/// Failures of chat operations. Variants with a wire code are reported to
/// the offending connection; `Internal` stays on the server side.
#[derive(Debug, Error)]
pub enum ChatError {
	#[error("unauthorized: {0}")]
	Unauthorized(String),

	#[error("forbidden: {0}")]
	Forbidden(String),

	#[error("not found: {0}")]
	NotFound(String),

	#[error("invalid input: {0}")]
	InvalidInput(String),

	#[error(transparent)]
	Internal(#[from] anyhow::Error),
}

impl ChatError {
	/// Protocol error code, if this failure is client-visible.
	pub fn wire_code(&self) -> Option<ErrorCode> {
		match self {
			ChatError::Unauthorized(_) => Some(ErrorCode::Unauthorized),
			ChatError::Forbidden(_) => Some(ErrorCode::Forbidden),
			ChatError::NotFound(_) => Some(ErrorCode::NotFound),
			ChatError::InvalidInput(_) => Some(ErrorCode::InvalidInput),
			ChatError::Internal(_) => None,
		}
	}

	/// Client-facing message. Internal detail is not leaked.
	pub fn wire_message(&self) -> String {
		match self {
			ChatError::Internal(_) => "internal error".to_string(),
			other => other.to_string(),
		}
	}
}

impl From<DirectoryError> for ChatError {
	fn from(e: DirectoryError) -> Self {
		match e {
			DirectoryError::Unauthorized(m) => ChatError::Unauthorized(m),
			DirectoryError::Forbidden(m) => ChatError::Forbidden(m),
			DirectoryError::NotFound(m) => ChatError::NotFound(m),
			DirectoryError::Upstream(e) => ChatError::Internal(e),
		}
	}
}
