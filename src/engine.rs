use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use solana_sdk::{pubkey::Pubkey, signature::Signature};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::builder::PreparedTransaction;
use crate::cluster::{ClusterRpc, SignatureStatus};
use crate::error::{HarnessError, HarnessResult, TerminalReason};

/// Commitment level a submission waits for before reporting success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetCommitment {
	Confirmed,
	Finalized,
}

impl FromStr for TargetCommitment {
	type Err = HarnessError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"confirmed" => Ok(TargetCommitment::Confirmed),
			"finalized" => Ok(TargetCommitment::Finalized),
			other => Err(HarnessError::Config(format!("unknown commitment {other:?}"))),
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmationResult {
	Pending,
	Confirmed,
	Finalized,
	Failed(HarnessError),
}

impl ConfirmationResult {
	fn rank(&self) -> u8 {
		match self {
			ConfirmationResult::Pending => 0,
			ConfirmationResult::Confirmed => 1,
			ConfirmationResult::Finalized | ConfirmationResult::Failed(_) => 2,
		}
	}

	pub fn is_terminal(&self) -> bool {
		matches!(self, ConfirmationResult::Finalized | ConfirmationResult::Failed(_))
	}

	pub fn is_success(&self) -> bool {
		matches!(self, ConfirmationResult::Confirmed | ConfirmationResult::Finalized)
	}

	/// Moves forward only; a terminal result never changes and a lower
	/// level never replaces a higher one. Returns whether anything changed.
	pub fn advance(&mut self, next: ConfirmationResult) -> bool {
		if self.is_terminal() || (next.rank() <= self.rank() && !matches!(next, ConfirmationResult::Failed(_))) {
			return false;
		}
		*self = next;
		true
	}

	pub fn into_result(self) -> HarnessResult<ConfirmationResult> {
		match self {
			ConfirmationResult::Failed(err) => Err(err),
			other => Ok(other),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
	Unsent,
	Submitted,
	Pending,
	Confirmed,
	Finalized,
	Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitPolicy {
	/// Cap on the whole submission, sending and polling included.
	pub timeout: Duration,
	pub poll_interval: Duration,
	pub max_retries: u32,
	pub backoff_base: Duration,
	pub backoff_max: Duration,
	pub commitment: TargetCommitment,
}

impl Default for SubmitPolicy {
	fn default() -> Self {
		Self {
			timeout: Duration::from_secs(60),
			poll_interval: Duration::from_millis(500),
			max_retries: 3,
			backoff_base: Duration::from_millis(250),
			backoff_max: Duration::from_secs(4),
			commitment: TargetCommitment::Confirmed,
		}
	}
}

impl SubmitPolicy {
	/// Delay before retry number `retry` (zero based): `base * 2^retry`,
	/// capped at `backoff_max`.
	pub fn backoff(&self, retry: u32) -> Duration {
		let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
		self.backoff_base.saturating_mul(factor).min(self.backoff_max)
	}
}

#[derive(Debug, Clone)]
pub struct Submission {
	pub signature: Signature,
	pub result: ConfirmationResult,
	pub state: SubmissionState,
	pub retries: u32,
	pub polls: u32,
	pub elapsed: Duration,
}

struct Progress {
	signature: Signature,
	state: SubmissionState,
	result: ConfirmationResult,
	retries: u32,
	polls: u32,
}

impl Progress {
	fn new(signature: Signature) -> Self {
		Self { signature, state: SubmissionState::Unsent, result: ConfirmationResult::Pending, retries: 0, polls: 0 }
	}

	fn finish(mut self, result: ConfirmationResult, started: Instant) -> Submission {
		self.result.advance(result);
		self.state = match &self.result {
			ConfirmationResult::Pending => SubmissionState::Pending,
			ConfirmationResult::Confirmed => SubmissionState::Confirmed,
			ConfirmationResult::Finalized => SubmissionState::Finalized,
			ConfirmationResult::Failed(_) => SubmissionState::Failed,
		};
		Submission {
			signature: self.signature,
			result: self.result,
			state: self.state,
			retries: self.retries,
			polls: self.polls,
			elapsed: started.elapsed(),
		}
	}
}

/// Sends transactions and waits for them. Holds no per-transaction state
/// between calls, so one engine can serve many cases concurrently.
#[derive(Clone)]
pub struct SubmissionEngine {
	cluster: Arc<dyn ClusterRpc>,
	policy: SubmitPolicy,
}

impl SubmissionEngine {
	pub fn new(cluster: Arc<dyn ClusterRpc>, policy: SubmitPolicy) -> Self {
		Self { cluster, policy }
	}

	pub fn policy(&self) -> &SubmitPolicy {
		&self.policy
	}

	pub fn cluster(&self) -> &Arc<dyn ClusterRpc> {
		&self.cluster
	}

	/// Same cluster and policy, waiting for `commitment` instead.
	pub fn with_commitment(&self, commitment: TargetCommitment) -> Self {
		let mut policy = self.policy.clone();
		policy.commitment = commitment;
		Self { cluster: self.cluster.clone(), policy }
	}

	pub async fn submit(&self, tx: &PreparedTransaction) -> Submission {
		self.submit_with(tx, self.policy.timeout, self.policy.poll_interval).await
	}

	pub async fn submit_with(&self, tx: &PreparedTransaction, timeout: Duration, poll_interval: Duration) -> Submission {
		let started = Instant::now();
		let mut progress = Progress::new(tx.signature());
		if !tx.is_fully_signed() {
			let err = HarnessError::malformed(format!("transaction is missing signatures from {:?}", tx.missing_signers));
			return progress.finish(ConfirmationResult::Failed(err), started);
		}

		let cluster = self.cluster.clone();
		let expiry = Some(tx.marker.last_valid_block_height);
		let result = self
			.run(&mut progress, timeout, poll_interval, expiry, || {
				let cluster = cluster.clone();
				async move { cluster.send_transaction(&tx.transaction).await }
			})
			.await;
		progress.finish(result, started)
	}

	/// Requests an airdrop and waits for it like any other submission.
	pub async fn fund(&self, to: &Pubkey, lamports: u64) -> HarnessResult<Submission> {
		let started = Instant::now();
		let mut progress = Progress::new(Signature::default());
		let cluster = self.cluster.clone();
		let to = *to;
		let result = self
			.run(&mut progress, self.policy.timeout, self.policy.poll_interval, None, || {
				let cluster = cluster.clone();
				async move { cluster.request_airdrop(&to, lamports).await }
			})
			.await;
		let submission = progress.finish(result, started);
		match &submission.result {
			ConfirmationResult::Failed(err) => Err(err.clone()),
			_ => {
				info!(%to, lamports, signature = %submission.signature, "funded account");
				Ok(submission)
			}
		}
	}

	async fn run<F, Fut>(
		&self,
		progress: &mut Progress,
		timeout: Duration,
		poll_interval: Duration,
		expiry: Option<u64>,
		send: F,
	) -> ConfirmationResult
	where
		F: Fn() -> Fut,
		Fut: Future<Output = HarnessResult<Signature>>,
	{
		// Dropping the inner future on expiry cancels whichever send or poll
		// was in flight.
		let outcome = tokio::time::timeout(timeout, self.drive(progress, poll_interval, expiry, send)).await;
		match outcome {
			Ok(result) => result,
			Err(_) => {
				warn!(signature = %progress.signature, ?timeout, state = ?progress.state, "submission timed out");
				ConfirmationResult::Failed(HarnessError::Timeout(timeout))
			}
		}
	}

	/// `expiry` is the last block height at which the transaction can still
	/// land. Airdrops carry none.
	async fn drive<F, Fut>(
		&self,
		progress: &mut Progress,
		poll_interval: Duration,
		expiry: Option<u64>,
		send: F,
	) -> ConfirmationResult
	where
		F: Fn() -> Fut,
		Fut: Future<Output = HarnessResult<Signature>>,
	{
		let signature = loop {
			match send().await {
				Ok(signature) => break signature,
				Err(err) if err.is_retryable() && progress.retries < self.policy.max_retries => {
					let delay = self.policy.backoff(progress.retries);
					progress.retries += 1;
					warn!(attempt = progress.retries, ?delay, error = %err, "transient submission error, retrying");
					tokio::time::sleep(delay).await;
				}
				Err(err) if err.is_retryable() => {
					warn!(retries = progress.retries, error = %err, "submission retries exhausted");
					return ConfirmationResult::Failed(HarnessError::TransientNetwork(format!(
						"{err} (gave up after {} retries)",
						progress.retries
					)));
				}
				Err(err) => {
					warn!(error = %err, "terminal submission error");
					return ConfirmationResult::Failed(err);
				}
			}
		};
		progress.signature = signature;
		progress.state = SubmissionState::Submitted;
		debug!(%signature, "submitted, polling for confirmation");

		let mut past_expiry = false;
		loop {
			progress.polls += 1;
			match self.cluster.signature_status(&signature).await {
				Ok(SignatureStatus::Unknown) => {
					progress.state = SubmissionState::Pending;
					if let Some(last_valid) = expiry {
						// unknown on a poll made after the height passed the marker: it will never land
						if past_expiry {
							warn!(%signature, last_valid, "transaction dropped, validity marker expired");
							return ConfirmationResult::Failed(HarnessError::TerminalSubmission(
								TerminalReason::ValidityMarkerExpired,
							));
						}
						if self.height_passed(last_valid).await {
							past_expiry = true;
							continue;
						}
					}
				}
				Ok(SignatureStatus::Processed) => {
					progress.state = SubmissionState::Pending;
				}
				Ok(SignatureStatus::Confirmed) => {
					progress.result.advance(ConfirmationResult::Confirmed);
					progress.state = SubmissionState::Confirmed;
					if self.policy.commitment == TargetCommitment::Confirmed {
						info!(%signature, polls = progress.polls, "transaction confirmed");
						return ConfirmationResult::Confirmed;
					}
				}
				Ok(SignatureStatus::Finalized) => {
					info!(%signature, polls = progress.polls, "transaction finalized");
					return ConfirmationResult::Finalized;
				}
				Ok(SignatureStatus::Failed(reason)) => {
					warn!(%signature, %reason, "transaction failed on chain");
					return ConfirmationResult::Failed(HarnessError::TerminalSubmission(reason));
				}
				Err(err) if err.is_retryable() => {
					debug!(%signature, error = %err, "status poll failed, will poll again");
				}
				Err(err) => return ConfirmationResult::Failed(err),
			}
			tokio::time::sleep(poll_interval).await;
		}
	}

	async fn height_passed(&self, last_valid: u64) -> bool {
		match self.cluster.block_height().await {
			Ok(height) => height > last_valid,
			Err(err) => {
				debug!(error = %err, "block height unavailable, will poll again");
				false
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn results_only_move_forward() {
		let mut result = ConfirmationResult::Pending;
		assert!(result.advance(ConfirmationResult::Confirmed));
		assert!(!result.advance(ConfirmationResult::Pending));
		assert_eq!(result, ConfirmationResult::Confirmed);
		assert!(result.advance(ConfirmationResult::Finalized));
		assert!(!result.advance(ConfirmationResult::Failed(HarnessError::Timeout(Duration::from_secs(1)))));
		assert_eq!(result, ConfirmationResult::Finalized);

		let mut failed = ConfirmationResult::Failed(HarnessError::TerminalSubmission(TerminalReason::InvalidSignature));
		assert!(!failed.advance(ConfirmationResult::Finalized));
		assert!(!failed.is_success());
	}

	#[test]
	fn backoff_doubles_up_to_cap() {
		let policy = SubmitPolicy {
			backoff_base: Duration::from_millis(100),
			backoff_max: Duration::from_millis(500),
			..Default::default()
		};
		assert_eq!(policy.backoff(0), Duration::from_millis(100));
		assert_eq!(policy.backoff(1), Duration::from_millis(200));
		assert_eq!(policy.backoff(2), Duration::from_millis(400));
		assert_eq!(policy.backoff(3), Duration::from_millis(500));
		assert_eq!(policy.backoff(40), Duration::from_millis(500));
	}

	#[test]
	fn commitment_parses_case_insensitively() {
		assert_eq!("Finalized".parse::<TargetCommitment>().unwrap(), TargetCommitment::Finalized);
		assert!("processed".parse::<TargetCommitment>().is_err());
	}
}
