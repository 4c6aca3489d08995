use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use solana_sdk::{
	pubkey::Pubkey,
	signature::{read_keypair_file, Keypair, Signer},
};
use tracing::{debug, warn};

use crate::error::{HarnessError, HarnessResult};

/// A keypair owned by the running test process. Cloning shares the same key
/// material; nothing is ever written to disk.
#[derive(Clone)]
pub struct Identity {
	keypair: Arc<Keypair>,
}

impl Identity {
	pub fn from_keypair(keypair: Keypair) -> Self {
		Self { keypair: Arc::new(keypair) }
	}

	pub fn pubkey(&self) -> Pubkey {
		self.keypair.pubkey()
	}

	pub fn keypair(&self) -> &Keypair {
		&self.keypair
	}
}

impl fmt::Debug for Identity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Identity").field("pubkey", &self.pubkey()).finish()
	}
}

impl PartialEq for Identity {
	fn eq(&self, other: &Self) -> bool {
		self.pubkey() == other.pubkey()
	}
}

impl Eq for Identity {}

/// Hands out fresh identities and remembers every public key it issued.
#[derive(Clone, Default)]
pub struct IdentityGenerator {
	issued: Arc<Mutex<HashSet<Pubkey>>>,
}

impl IdentityGenerator {
	pub fn new() -> Self {
		Self::default()
	}

	/// Key material comes from the OS RNG. A collision with an earlier key is
	/// astronomically unlikely; if it ever happens the key is discarded.
	pub fn new_identity(&self) -> Identity {
		let mut issued = self.issued.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
		loop {
			let keypair = Keypair::new();
			let pubkey = keypair.pubkey();
			if issued.insert(pubkey) {
				debug!(%pubkey, "generated identity");
				return Identity::from_keypair(keypair);
			}
			warn!(%pubkey, "discarding colliding identity");
		}
	}

	pub fn issued_count(&self) -> usize {
		self.issued.lock().map(|s| s.len()).unwrap_or_else(|poisoned| poisoned.into_inner().len())
	}
}

/// Loads the default payer wallet. The 64 raw keypair bytes may be given
/// inline as `HARNESS_PAYER_BASE58` (wallet export format) or
/// `HARNESS_PAYER_BASE64`; either takes precedence over the keypair file at
/// `path`.
pub fn load_payer(path: Option<&str>) -> HarnessResult<Identity> {
	if let Some(bytes) = inline_keypair_bytes()? {
		let kp = Keypair::from_bytes(&bytes).map_err(|e| HarnessError::Config(format!("invalid keypair bytes: {e}")))?;
		return Ok(Identity::from_keypair(kp));
	}
	let path = path.ok_or_else(|| HarnessError::Config("no payer keypair configured".to_string()))?;
	let path = expand_home(path);
	let kp = read_keypair_file(&path).map_err(|e| HarnessError::Config(format!("failed to read keypair {path}: {e}")))?;
	Ok(Identity::from_keypair(kp))
}

/// Whether [`load_payer`] has anything to load.
pub fn payer_configured(path: Option<&str>) -> bool {
	path.is_some() || std::env::var("HARNESS_PAYER_BASE58").is_ok() || std::env::var("HARNESS_PAYER_BASE64").is_ok()
}

fn inline_keypair_bytes() -> HarnessResult<Option<Vec<u8>>> {
	if let Ok(b58) = std::env::var("HARNESS_PAYER_BASE58") {
		let bytes = bs58::decode(b58.trim())
			.into_vec()
			.map_err(|e| HarnessError::Config(format!("invalid base58 keypair: {e}")))?;
		return Ok(Some(bytes));
	}
	if let Ok(b64) = std::env::var("HARNESS_PAYER_BASE64") {
		use base64::Engine;
		let bytes = base64::engine::general_purpose::STANDARD
			.decode(b64.trim())
			.map_err(|e| HarnessError::Config(format!("invalid base64 keypair: {e}")))?;
		return Ok(Some(bytes));
	}
	Ok(None)
}

fn expand_home(path: &str) -> String {
	match (path.strip_prefix("~/"), std::env::var("HOME")) {
		(Some(rest), Ok(home)) => format!("{home}/{rest}"),
		_ => path.to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn generated_identities_are_pairwise_distinct() {
		let gen = IdentityGenerator::new();
		let keys: HashSet<Pubkey> = (0..256).map(|_| gen.new_identity().pubkey()).collect();
		assert_eq!(keys.len(), 256);
		assert_eq!(gen.issued_count(), 256);
	}

	#[test]
	fn clones_share_key_material() {
		let id = IdentityGenerator::new().new_identity();
		let copy = id.clone();
		assert_eq!(id, copy);
		assert_eq!(id.keypair().to_bytes(), copy.keypair().to_bytes());
	}

	#[test]
	fn keypair_file_round_trips() {
		use solana_sdk::signature::write_keypair_file;

		let kp = Keypair::new();
		let expected = kp.pubkey();
		let path = std::env::temp_dir().join(format!("harness-payer-{expected}.json"));
		write_keypair_file(&kp, &path).unwrap();

		let loaded = load_payer(path.to_str()).unwrap();
		assert_eq!(loaded.pubkey(), expected);
		let _ = std::fs::remove_file(path);
	}
}
