#![forbid(unsafe_code)]

pub mod http;
pub mod memory;

use core::fmt;

use async_trait::async_trait;
use casechat_domain::{DocumentId, Identity, UserId};
use thiserror::Error;

/// Failures crossing the boundary into the surrounding business application.
#[derive(Debug, Error)]
pub enum DirectoryError {
	#[error("unauthorized: {0}")]
	Unauthorized(String),

	#[error("forbidden: {0}")]
	Forbidden(String),

	#[error("not found: {0}")]
	NotFound(String),

	#[error(transparent)]
	Upstream(#[from] anyhow::Error),
}

/// What the chat layer needs to know about a business document.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DocumentRecord {
	pub id: DocumentId,
	/// Dealer-of-record; always a participant of the document's room.
	pub dealer_id: UserId,
}

impl DocumentRecord {
	/// Whether `identity` may act on this document's room. Dealers must be
	/// the dealer-of-record; any worker identity is permitted.
	pub fn permits(&self, identity: &Identity) -> bool {
		match identity.role {
			casechat_domain::Role::Worker => true,
			casechat_domain::Role::Dealer => identity.user_id == self.dealer_id,
		}
	}
}

/// Resolves session tokens to identities. Tokens are issued elsewhere;
/// the chat layer never sees passwords.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
	async fn resolve_token(&self, credential_token: &str) -> Result<Identity, DirectoryError>;
}

/// Looks up business documents for authorization checks.
#[async_trait]
pub trait DocumentStore: Send + Sync {
	async fn fetch_document(&self, document_id: DocumentId) -> Result<DocumentRecord, DirectoryError>;
}

/// Wrapper that redacts in logs.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
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

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}
