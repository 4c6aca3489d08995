use std::time::Duration;

use serde::Serialize;
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;

use crate::verifier::FieldDiff;

/// Why the cluster refused a transaction outright. None of these get better
/// by resending the same bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TerminalReason {
	#[error("invalid signature")]
	InvalidSignature,
	#[error("insufficient funds")]
	InsufficientFunds,
	#[error("validity marker expired")]
	ValidityMarkerExpired,
	#[error("program rejected transaction: {0}")]
	ProgramRejected(String),
	#[error("instruction {instruction} failed with custom program error {code:#x}")]
	ProgramError { instruction: u8, code: u32 },
	#[error("{0}")]
	Other(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HarnessError {
	#[error("Transient network error: {0}")]
	TransientNetwork(String),
	#[error("Terminal submission error: {0}")]
	TerminalSubmission(TerminalReason),
	#[error("Timed out after {0:?}")]
	Timeout(Duration),
	#[error("Account not found: {0}")]
	AccountNotFound(Pubkey),
	#[error("Malformed instruction: {0}")]
	MalformedInstruction(String),
	#[error("Schema mismatch: {message} (raw: {raw})")]
	SchemaMismatch { message: String, raw: String },
	#[error("Verification failed: {} field(s) differ", .0.len())]
	VerificationFailed(Vec<FieldDiff>),
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Case panicked: {0}")]
	CasePanicked(String),
	#[error("Expected {0:?} failure but case succeeded")]
	UnexpectedSuccess(ErrorKind),
	#[error("Internal error: {0}")]
	Internal(String),
}

/// Discriminant recorded in case reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
	TransientNetwork,
	TerminalSubmission,
	Timeout,
	AccountNotFound,
	MalformedInstruction,
	SchemaMismatch,
	VerificationFailed,
	Config,
	CasePanicked,
	UnexpectedSuccess,
	Internal,
}

impl HarnessError {
	pub fn kind(&self) -> ErrorKind {
		match self {
			HarnessError::TransientNetwork(_) => ErrorKind::TransientNetwork,
			HarnessError::TerminalSubmission(_) => ErrorKind::TerminalSubmission,
			HarnessError::Timeout(_) => ErrorKind::Timeout,
			HarnessError::AccountNotFound(_) => ErrorKind::AccountNotFound,
			HarnessError::MalformedInstruction(_) => ErrorKind::MalformedInstruction,
			HarnessError::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
			HarnessError::VerificationFailed(_) => ErrorKind::VerificationFailed,
			HarnessError::Config(_) => ErrorKind::Config,
			HarnessError::CasePanicked(_) => ErrorKind::CasePanicked,
			HarnessError::UnexpectedSuccess(_) => ErrorKind::UnexpectedSuccess,
			HarnessError::Internal(_) => ErrorKind::Internal,
		}
	}

	/// Only transient network failures are worth another attempt.
	pub fn is_retryable(&self) -> bool {
		matches!(self, HarnessError::TransientNetwork(_))
	}

	pub fn malformed(msg: impl Into<String>) -> Self {
		HarnessError::MalformedInstruction(msg.into())
	}

	pub fn schema(message: impl Into<String>, raw: &[u8]) -> Self {
		use base64::Engine;
		HarnessError::SchemaMismatch {
			message: message.into(),
			raw: base64::engine::general_purpose::STANDARD.encode(raw),
		}
	}
}

pub type HarnessResult<T> = Result<T, HarnessError>;
