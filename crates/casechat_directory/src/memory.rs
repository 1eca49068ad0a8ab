#![forbid(unsafe_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use casechat_domain::{DocumentId, Identity};
use parking_lot::RwLock;

use crate::{DirectoryError, DocumentRecord, DocumentStore, IdentityProvider};

/// In-memory directory for tests and demo deployments. Tokens and
/// documents are seeded up front; lookups never leave the process.
#[derive(Default)]
pub struct MemoryDirectory {
	inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
	tokens: HashMap<String, Identity>,
	documents: HashMap<DocumentId, DocumentRecord>,
}

impl MemoryDirectory {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert_token(&self, token: impl Into<String>, identity: Identity) {
		self.inner.write().tokens.insert(token.into(), identity);
	}

	pub fn insert_document(&self, record: DocumentRecord) {
		self.inner.write().documents.insert(record.id, record);
	}

	pub fn revoke_token(&self, token: &str) {
		self.inner.write().tokens.remove(token);
	}
}

#[async_trait]
impl IdentityProvider for MemoryDirectory {
	async fn resolve_token(&self, credential_token: &str) -> Result<Identity, DirectoryError> {
		self.inner
			.read()
			.tokens
			.get(credential_token)
			.cloned()
			.ok_or_else(|| DirectoryError::Unauthorized("unknown session token".to_string()))
	}
}

#[async_trait]
impl DocumentStore for MemoryDirectory {
	async fn fetch_document(&self, document_id: DocumentId) -> Result<DocumentRecord, DirectoryError> {
		self.inner
			.read()
			.documents
			.get(&document_id)
			.cloned()
			.ok_or_else(|| DirectoryError::NotFound(format!("document {document_id}")))
	}
}

#[cfg(test)]
mod tests {
	use casechat_domain::{Role, UserId};

	use super::*;

	#[tokio::test]
	async fn resolves_seeded_tokens_and_documents() {
		let dir = MemoryDirectory::new();
		dir.insert_token(
			"tok-w",
			Identity {
				user_id: UserId::new("w1").unwrap(),
				name: "Worker One".to_string(),
				role: Role::Worker,
			},
		);
		dir.insert_document(DocumentRecord {
			id: DocumentId(42),
			dealer_id: UserId::new("d1").unwrap(),
		});

		let id = dir.resolve_token("tok-w").await.unwrap();
		assert_eq!(id.role, Role::Worker);

		let doc = dir.fetch_document(DocumentId(42)).await.unwrap();
		assert_eq!(doc.dealer_id.as_str(), "d1");

		assert!(matches!(
			dir.resolve_token("nope").await,
			Err(DirectoryError::Unauthorized(_))
		));
		assert!(matches!(
			dir.fetch_document(DocumentId(1)).await,
			Err(DirectoryError::NotFound(_))
		));
	}

	#[tokio::test]
	async fn revoked_token_stops_resolving() {
		let dir = MemoryDirectory::new();
		dir.insert_token(
			"tok",
			Identity {
				user_id: UserId::new("u").unwrap(),
				name: "U".to_string(),
				role: Role::Dealer,
			},
		);
		assert!(dir.resolve_token("tok").await.is_ok());
		dir.revoke_token("tok");
		assert!(dir.resolve_token("tok").await.is_err());
	}
}
