#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use casechat_directory::{DirectoryError, IdentityProvider, SecretString};
use casechat_domain::{Identity, Role, UserId};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Claims carried in a `v1.<payload>.<sig>` session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub name: String,
	pub role: Role,
	pub exp: u64,
}

pub fn verify_hmac_token(token: &str, secret: &str) -> anyhow::Result<AuthClaims> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(anyhow!("invalid token format"));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
	if claims.exp <= now {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

/// Mint a token for `claims`. Used by ops tooling and tests; the business
/// application holds the same secret and issues tokens the same way.
pub fn issue_hmac_token(claims: &AuthClaims, secret: &str) -> anyhow::Result<String> {
	let payload = serde_json::to_vec(claims).context("serialize token claims")?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	Ok(format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

/// Identity provider backed by HMAC session tokens signed with a shared
/// secret. Verification is local; no directory round trip.
pub struct HmacIdentityProvider {
	secret: SecretString,
}

impl HmacIdentityProvider {
	pub fn new(secret: SecretString) -> Self {
		Self { secret }
	}
}

#[async_trait]
impl IdentityProvider for HmacIdentityProvider {
	async fn resolve_token(&self, credential_token: &str) -> Result<Identity, DirectoryError> {
		let claims = verify_hmac_token(credential_token.trim(), self.secret.expose())
			.map_err(|e| DirectoryError::Unauthorized(e.to_string()))?;
		let user_id = UserId::new(claims.sub).map_err(|e| DirectoryError::Unauthorized(e.to_string()))?;
		Ok(Identity {
			user_id,
			name: claims.name,
			role: claims.role,
		})
	}
}
