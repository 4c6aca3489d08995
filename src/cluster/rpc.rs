use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use solana_client::{
	client_error::{ClientError, ClientErrorKind},
	nonblocking::rpc_client::RpcClient,
	rpc_config::RpcSendTransactionConfig,
	rpc_request::RpcError,
};
use solana_sdk::{
	account::Account,
	commitment_config::CommitmentConfig,
	instruction::InstructionError,
	pubkey::Pubkey,
	signature::Signature,
	transaction::{Transaction, TransactionError},
};
use solana_transaction_status::{TransactionConfirmationStatus, UiTransactionEncoding};
use tracing::debug;

use super::{ClusterRpc, SignatureStatus};
use crate::builder::ValidityMarker;
use crate::error::{HarnessError, HarnessResult, TerminalReason};

// JSON-RPC error codes a node returns while it is catching up or shedding load.
const NODE_UNHEALTHY: i64 = -32005;
const BLOCK_NOT_AVAILABLE: i64 = -32004;
const MIN_CONTEXT_SLOT_NOT_REACHED: i64 = -32016;

/// Live cluster over JSON-RPC. Clones share one `RpcClient` and therefore
/// one pooled HTTP connection set.
#[derive(Clone)]
pub struct SolanaCluster {
	rpc: Arc<RpcClient>,
	commitment: CommitmentConfig,
}

impl SolanaCluster {
	pub fn new(rpc_url: &str) -> Self {
		Self::with_timeout(rpc_url, Duration::from_secs(30))
	}

	pub fn with_timeout(rpc_url: &str, request_timeout: Duration) -> Self {
		let commitment = CommitmentConfig::confirmed();
		Self {
			rpc: Arc::new(RpcClient::new_with_timeout_and_commitment(rpc_url.to_string(), request_timeout, commitment)),
			commitment,
		}
	}

	pub fn url(&self) -> String {
		self.rpc.url()
	}
}

#[async_trait]
impl ClusterRpc for SolanaCluster {
	async fn latest_validity_marker(&self) -> HarnessResult<ValidityMarker> {
		let (blockhash, last_valid_block_height) = self
			.rpc
			.get_latest_blockhash_with_commitment(self.commitment)
			.await
			.map_err(|e| classify_client_error(&e))?;
		Ok(ValidityMarker { blockhash, last_valid_block_height })
	}

	async fn send_transaction(&self, transaction: &Transaction) -> HarnessResult<Signature> {
		let config = RpcSendTransactionConfig {
			preflight_commitment: Some(self.commitment.commitment),
			encoding: Some(UiTransactionEncoding::Base64),
			..RpcSendTransactionConfig::default()
		};
		let signature = self
			.rpc
			.send_transaction_with_config(transaction, config)
			.await
			.map_err(|e| classify_client_error(&e))?;
		debug!(%signature, "transaction accepted by rpc node");
		Ok(signature)
	}

	async fn signature_status(&self, signature: &Signature) -> HarnessResult<SignatureStatus> {
		let response = self
			.rpc
			.get_signature_statuses(&[*signature])
			.await
			.map_err(|e| classify_client_error(&e))?;
		let Some(status) = response.value.into_iter().next().flatten() else {
			return Ok(SignatureStatus::Unknown);
		};
		if let Some(err) = &status.err {
			return Ok(SignatureStatus::Failed(classify_transaction_error(err)));
		}
		Ok(match status.confirmation_status() {
			TransactionConfirmationStatus::Processed => SignatureStatus::Processed,
			TransactionConfirmationStatus::Confirmed => SignatureStatus::Confirmed,
			TransactionConfirmationStatus::Finalized => SignatureStatus::Finalized,
		})
	}

	async fn block_height(&self) -> HarnessResult<u64> {
		self.rpc
			.get_block_height_with_commitment(self.commitment)
			.await
			.map_err(|e| classify_client_error(&e))
	}

	async fn account(&self, address: &Pubkey) -> HarnessResult<Option<Account>> {
		let response = self
			.rpc
			.get_account_with_commitment(address, self.commitment)
			.await
			.map_err(|e| classify_client_error(&e))?;
		Ok(response.value)
	}

	async fn request_airdrop(&self, to: &Pubkey, lamports: u64) -> HarnessResult<Signature> {
		self.rpc.request_airdrop(to, lamports).await.map_err(|e| classify_client_error(&e))
	}
}

/// Sorts client errors into "try again" and "give up".
pub fn classify_client_error(err: &ClientError) -> HarnessError {
	if let Some(tx_err) = err.get_transaction_error() {
		return HarnessError::TerminalSubmission(classify_transaction_error(&tx_err));
	}
	let msg = err.to_string();
	match err.kind() {
		ClientErrorKind::Io(_) => HarnessError::TransientNetwork(msg),
		ClientErrorKind::Reqwest(e) => {
			// a body that fails to decode has no status either, and is not worth resending
			let retryable_status = matches!(e.status().map(|s| s.as_u16()), Some(429) | Some(500..=599));
			if e.is_timeout() || e.is_connect() || e.is_request() || retryable_status {
				HarnessError::TransientNetwork(msg)
			} else {
				HarnessError::TerminalSubmission(TerminalReason::Other(msg))
			}
		}
		ClientErrorKind::RpcError(RpcError::RpcResponseError { code, message, .. }) => match *code {
			NODE_UNHEALTHY | BLOCK_NOT_AVAILABLE | MIN_CONTEXT_SLOT_NOT_REACHED => {
				HarnessError::TransientNetwork(format!("{code}: {message}"))
			}
			_ if message.to_ascii_lowercase().contains("rate limit") => {
				HarnessError::TransientNetwork(format!("{code}: {message}"))
			}
			_ => HarnessError::TerminalSubmission(TerminalReason::Other(format!("{code}: {message}"))),
		},
		ClientErrorKind::SigningError(_) => HarnessError::TerminalSubmission(TerminalReason::InvalidSignature),
		_ => HarnessError::TerminalSubmission(TerminalReason::Other(msg)),
	}
}

pub fn classify_transaction_error(err: &TransactionError) -> TerminalReason {
	match err {
		TransactionError::BlockhashNotFound => TerminalReason::ValidityMarkerExpired,
		TransactionError::InsufficientFundsForFee | TransactionError::InsufficientFundsForRent { .. } => {
			TerminalReason::InsufficientFunds
		}
		TransactionError::SignatureFailure | TransactionError::MissingSignatureForFee => {
			TerminalReason::InvalidSignature
		}
		TransactionError::InstructionError(_, InstructionError::InsufficientFunds) => TerminalReason::InsufficientFunds,
		TransactionError::InstructionError(index, InstructionError::Custom(code)) => {
			TerminalReason::ProgramError { instruction: *index, code: *code }
		}
		TransactionError::InstructionError(index, ix_err) => {
			TerminalReason::ProgramRejected(format!("instruction {index}: {ix_err}"))
		}
		other => TerminalReason::Other(other.to_string()),
	}
}
