use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::engine::{SubmitPolicy, TargetCommitment};
use crate::error::{HarnessError, HarnessResult};

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8899";
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// File keys are accepted in snake_case or camelCase. Unknown keys are an
/// error so a misspelling cannot silently fall back to a default.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
	pub endpoint: String,
	#[serde(alias = "defaultTimeoutMs")]
	pub default_timeout_ms: u64,
	#[serde(alias = "maxRetries")]
	pub max_retries: u32,
	#[serde(alias = "pollIntervalMs")]
	pub poll_interval_ms: u64,
	#[serde(alias = "backoffBaseMs")]
	pub backoff_base_ms: u64,
	#[serde(alias = "backoffMaxMs")]
	pub backoff_max_ms: u64,
	pub commitment: TargetCommitment,
	#[serde(alias = "payerKeypairPath")]
	pub payer_keypair_path: Option<String>,
	#[serde(alias = "programId")]
	pub program_id: Option<String>,
	#[serde(alias = "idlPath")]
	pub idl_path: Option<String>,
	pub concurrency: usize,
	#[serde(alias = "airdropLamports")]
	pub airdrop_lamports: u64,
}

impl Default for HarnessConfig {
	fn default() -> Self {
		Self {
			endpoint: DEFAULT_ENDPOINT.to_string(),
			default_timeout_ms: 60_000,
			max_retries: 3,
			poll_interval_ms: 500,
			backoff_base_ms: 250,
			backoff_max_ms: 4_000,
			commitment: TargetCommitment::Confirmed,
			payer_keypair_path: None,
			program_id: None,
			idl_path: None,
			concurrency: 1,
			airdrop_lamports: LAMPORTS_PER_SOL,
		}
	}
}

impl HarnessConfig {
	/// Reads `HARNESS_CONFIG` (a JSON file) when set, then lets individual
	/// `HARNESS_*` variables override it. The Anchor provider variables
	/// (`ANCHOR_PROVIDER_URL`, `ANCHOR_WALLET`) are honoured as fallbacks.
	pub fn from_env() -> HarnessResult<Self> {
		let mut cfg = match std::env::var("HARNESS_CONFIG") {
			Ok(path) => Self::from_file(&path)?,
			Err(_) => Self::default(),
		};

		if let Some(endpoint) = env_string("HARNESS_ENDPOINT").or_else(|| env_string("ANCHOR_PROVIDER_URL")) {
			cfg.endpoint = endpoint;
		}
		if let Some(path) = env_string("HARNESS_PAYER_KEYPAIR").or_else(|| env_string("ANCHOR_WALLET")) {
			cfg.payer_keypair_path = Some(path);
		}
		if let Some(program_id) = env_string("HARNESS_PROGRAM_ID") {
			cfg.program_id = Some(program_id);
		}
		if let Some(idl_path) = env_string("HARNESS_IDL_PATH") {
			cfg.idl_path = Some(idl_path);
		}
		cfg.default_timeout_ms = env_parse("HARNESS_DEFAULT_TIMEOUT_MS", cfg.default_timeout_ms)?;
		cfg.max_retries = env_parse("HARNESS_MAX_RETRIES", cfg.max_retries)?;
		cfg.poll_interval_ms = env_parse("HARNESS_POLL_INTERVAL_MS", cfg.poll_interval_ms)?;
		cfg.backoff_base_ms = env_parse("HARNESS_BACKOFF_BASE_MS", cfg.backoff_base_ms)?;
		cfg.backoff_max_ms = env_parse("HARNESS_BACKOFF_MAX_MS", cfg.backoff_max_ms)?;
		cfg.commitment = env_parse("HARNESS_COMMITMENT", cfg.commitment)?;
		cfg.concurrency = env_parse("HARNESS_CONCURRENCY", cfg.concurrency)?;
		cfg.airdrop_lamports = env_parse("HARNESS_AIRDROP_LAMPORTS", cfg.airdrop_lamports)?;

		cfg.validate()?;
		Ok(cfg)
	}

	pub fn from_file(path: &str) -> HarnessResult<Self> {
		let raw = std::fs::read_to_string(path)
			.map_err(|e| HarnessError::Config(format!("read {path}: {e}")))?;
		let cfg: Self = serde_json::from_str(&raw)
			.map_err(|e| HarnessError::Config(format!("parse {path}: {e}")))?;
		cfg.validate()?;
		Ok(cfg)
	}

	pub fn validate(&self) -> HarnessResult<()> {
		if self.endpoint.is_empty() {
			return Err(HarnessError::Config("endpoint must not be empty".to_string()));
		}
		if self.default_timeout_ms == 0 {
			return Err(HarnessError::Config("default_timeout_ms must be positive".to_string()));
		}
		if self.poll_interval_ms == 0 {
			return Err(HarnessError::Config("poll_interval_ms must be positive".to_string()));
		}
		if self.concurrency == 0 {
			return Err(HarnessError::Config("concurrency must be at least 1".to_string()));
		}
		Ok(())
	}

	pub fn case_timeout(&self) -> Duration {
		Duration::from_millis(self.default_timeout_ms)
	}

	pub fn submit_policy(&self) -> SubmitPolicy {
		SubmitPolicy {
			timeout: self.case_timeout(),
			poll_interval: Duration::from_millis(self.poll_interval_ms),
			max_retries: self.max_retries,
			backoff_base: Duration::from_millis(self.backoff_base_ms),
			backoff_max: Duration::from_millis(self.backoff_max_ms),
			commitment: self.commitment,
		}
	}
}

fn env_string(key: &str) -> Option<String> {
	std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> HarnessResult<T> {
	match env_string(key) {
		Some(raw) => raw
			.trim()
			.parse()
			.map_err(|_| HarnessError::Config(format!("{key} has invalid value {raw:?}"))),
		None => Ok(default),
	}
}
