//! The request/response boundary to the ledger cluster.

pub mod rpc;
pub mod simulated;

use async_trait::async_trait;
use solana_sdk::{account::Account, pubkey::Pubkey, signature::Signature, transaction::Transaction};

use crate::builder::ValidityMarker;
use crate::error::{HarnessResult, TerminalReason};

pub use rpc::SolanaCluster;
pub use simulated::{InvocationContext, ProgramProcessor, SimulatedCluster};

/// What the cluster currently knows about a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureStatus {
	/// Not seen (yet), or already pruned from the status cache.
	Unknown,
	Processed,
	Confirmed,
	Finalized,
	Failed(TerminalReason),
}

#[async_trait]
pub trait ClusterRpc: Send + Sync {
	async fn latest_validity_marker(&self) -> HarnessResult<ValidityMarker>;

	/// Returns the signature the cluster accepted the transaction under.
	async fn send_transaction(&self, transaction: &Transaction) -> HarnessResult<Signature>;

	async fn signature_status(&self, signature: &Signature) -> HarnessResult<SignatureStatus>;

	/// Current block height, compared against a marker's last valid height.
	async fn block_height(&self) -> HarnessResult<u64>;

	async fn account(&self, address: &Pubkey) -> HarnessResult<Option<Account>>;

	async fn request_airdrop(&self, to: &Pubkey, lamports: u64) -> HarnessResult<Signature>;
}
