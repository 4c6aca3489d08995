//! In-process ledger used to drive the harness without a validator.
//!
//! Programs are plain Rust callbacks registered per program id; the cluster
//! itself only does what a validator's RPC front would: blockhash expiry,
//! signature and fee checks, atomic instruction execution, and a status
//! cache that moves from processed to finalized as it is polled. Faults can
//! be queued per operation to exercise retry and timeout paths.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use solana_sdk::{
	account::Account,
	hash::{hashv, Hash},
	instruction::InstructionError,
	message::Message,
	pubkey::Pubkey,
	signature::Signature,
	system_program,
	transaction::{Transaction, TransactionError},
};
use tracing::debug;

use super::rpc::classify_transaction_error;
use super::{ClusterRpc, SignatureStatus};
use crate::builder::ValidityMarker;
use crate::error::{HarnessError, HarnessResult, TerminalReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
	LatestValidityMarker,
	SendTransaction,
	SignatureStatus,
	BlockHeight,
	Account,
	RequestAirdrop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInput {
	pub pubkey: Pubkey,
	pub is_signer: bool,
	pub is_writable: bool,
}

/// One instruction as a program sees it.
#[derive(Debug, Clone)]
pub struct InvocationContext {
	pub program_id: Pubkey,
	pub accounts: Vec<AccountInput>,
	pub data: Vec<u8>,
}

pub trait ProgramProcessor: Send + Sync {
	fn process(&self, ctx: &InvocationContext, accounts: &mut HashMap<Pubkey, Account>) -> Result<(), InstructionError>;
}

impl<F> ProgramProcessor for F
where
	F: Fn(&InvocationContext, &mut HashMap<Pubkey, Account>) -> Result<(), InstructionError> + Send + Sync,
{
	fn process(&self, ctx: &InvocationContext, accounts: &mut HashMap<Pubkey, Account>) -> Result<(), InstructionError> {
		self(ctx, accounts)
	}
}

#[derive(Debug, Clone)]
pub struct SimulatedConfig {
	/// Blocks a blockhash stays valid for.
	pub validity_window: u64,
	pub polls_to_confirm: u32,
	pub polls_to_finalize: u32,
	pub lamports_per_signature: u64,
	/// Keep every accepted signature at `Processed` forever.
	pub never_confirm: bool,
	/// Artificial delay inside each status poll.
	pub status_latency: Option<Duration>,
	/// Accept transactions without ever landing them, as a node does when
	/// it forwards a transaction that is later dropped.
	pub drop_accepted: bool,
	/// Blocks produced per status poll.
	pub blocks_per_poll: u64,
}

impl Default for SimulatedConfig {
	fn default() -> Self {
		Self {
			validity_window: 150,
			polls_to_confirm: 1,
			polls_to_finalize: 2,
			lamports_per_signature: 5_000,
			never_confirm: false,
			status_latency: None,
			drop_accepted: false,
			blocks_per_poll: 0,
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatedStats {
	pub marker_requests: usize,
	pub send_attempts: usize,
	pub status_polls: usize,
	pub height_reads: usize,
	pub account_reads: usize,
	pub airdrops: usize,
}

impl SimulatedStats {
	pub fn network_calls(&self) -> usize {
		self.marker_requests
			+ self.send_attempts
			+ self.status_polls
			+ self.height_reads
			+ self.account_reads
			+ self.airdrops
	}
}

struct SignatureRecord {
	polls: u32,
}

#[derive(Default)]
struct LedgerState {
	accounts: HashMap<Pubkey, Account>,
	block_height: u64,
	blockhashes: HashMap<Hash, u64>,
	signatures: HashMap<Signature, SignatureRecord>,
	programs: HashMap<Pubkey, Arc<dyn ProgramProcessor>>,
	faults: HashMap<Operation, VecDeque<HarnessError>>,
	stats: SimulatedStats,
}

impl LedgerState {
	fn take_fault(&mut self, op: Operation) -> HarnessResult<()> {
		match self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
			Some(err) => Err(err),
			None => Ok(()),
		}
	}
}

#[derive(Clone)]
pub struct SimulatedCluster {
	config: SimulatedConfig,
	state: Arc<Mutex<LedgerState>>,
	in_flight_polls: Arc<AtomicUsize>,
}

impl Default for SimulatedCluster {
	fn default() -> Self {
		Self::new()
	}
}

impl SimulatedCluster {
	pub fn new() -> Self {
		Self::with_config(SimulatedConfig::default())
	}

	pub fn with_config(config: SimulatedConfig) -> Self {
		Self { config, state: Arc::new(Mutex::new(LedgerState::default())), in_flight_polls: Arc::new(AtomicUsize::new(0)) }
	}

	fn lock(&self) -> MutexGuard<'_, LedgerState> {
		self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	pub fn register_program(&self, program_id: Pubkey, processor: impl ProgramProcessor + 'static) {
		self.lock().programs.insert(program_id, Arc::new(processor));
	}

	pub fn set_account(&self, address: Pubkey, account: Account) {
		self.lock().accounts.insert(address, account);
	}

	/// Queues errors returned, in order, by the next calls of `op`.
	pub fn inject_faults(&self, op: Operation, errors: impl IntoIterator<Item = HarnessError>) {
		self.lock().faults.entry(op).or_default().extend(errors);
	}

	/// Moves the chain forward without issuing new blockhashes, expiring
	/// markers handed out earlier.
	pub fn advance_blocks(&self, blocks: u64) {
		self.lock().block_height += blocks;
	}

	pub fn stats(&self) -> SimulatedStats {
		self.lock().stats
	}

	pub fn in_flight_polls(&self) -> usize {
		self.in_flight_polls.load(Ordering::SeqCst)
	}

	fn execute(&self, state: &mut LedgerState, transaction: &Transaction) -> HarnessResult<()> {
		let message = &transaction.message;
		let payer = *message
			.account_keys
			.first()
			.ok_or_else(|| HarnessError::TerminalSubmission(TerminalReason::Other("message has no accounts".into())))?;
		let fee = self.config.lamports_per_signature * u64::from(message.header.num_required_signatures);

		let mut working = state.accounts.clone();
		match working.get_mut(&payer) {
			Some(account) if account.lamports >= fee => account.lamports -= fee,
			_ => return Err(HarnessError::TerminalSubmission(TerminalReason::InsufficientFunds)),
		}

		for (index, compiled) in message.instructions.iter().enumerate() {
			let program_id = message.account_keys[compiled.program_id_index as usize];
			let ctx = InvocationContext {
				program_id,
				accounts: compiled
					.accounts
					.iter()
					.map(|&i| AccountInput {
						pubkey: message.account_keys[i as usize],
						is_signer: is_signer_index(message, i as usize),
						is_writable: is_writable_index(message, i as usize),
					})
					.collect(),
				data: compiled.data.clone(),
			};
			let processor = state.programs.get(&program_id).cloned().ok_or_else(|| {
				HarnessError::TerminalSubmission(TerminalReason::ProgramRejected(format!(
					"program {program_id} is not deployed"
				)))
			})?;
			processor.process(&ctx, &mut working).map_err(|e| {
				let err = TransactionError::InstructionError(index as u8, e);
				HarnessError::TerminalSubmission(classify_transaction_error(&err))
			})?;
		}

		state.accounts = working;
		Ok(())
	}
}

fn is_signer_index(message: &Message, i: usize) -> bool {
	i < message.header.num_required_signatures as usize
}

fn is_writable_index(message: &Message, i: usize) -> bool {
	let header = &message.header;
	let signed = header.num_required_signatures as usize;
	if i < signed {
		i < signed - header.num_readonly_signed_accounts as usize
	} else {
		i - signed < message.account_keys.len() - signed - header.num_readonly_unsigned_accounts as usize
	}
}

struct PollGuard(Arc<AtomicUsize>);

impl PollGuard {
	fn enter(counter: &Arc<AtomicUsize>) -> Self {
		counter.fetch_add(1, Ordering::SeqCst);
		Self(counter.clone())
	}
}

impl Drop for PollGuard {
	fn drop(&mut self) {
		self.0.fetch_sub(1, Ordering::SeqCst);
	}
}

#[async_trait]
impl ClusterRpc for SimulatedCluster {
	async fn latest_validity_marker(&self) -> HarnessResult<ValidityMarker> {
		let mut state = self.lock();
		state.stats.marker_requests += 1;
		state.take_fault(Operation::LatestValidityMarker)?;
		state.block_height += 1;
		let height = state.block_height;
		let blockhash = hashv(&[b"simulated-blockhash".as_ref(), height.to_le_bytes().as_ref()]);
		let last_valid_block_height = height + self.config.validity_window;
		state.blockhashes.insert(blockhash, last_valid_block_height);
		Ok(ValidityMarker { blockhash, last_valid_block_height })
	}

	async fn send_transaction(&self, transaction: &Transaction) -> HarnessResult<Signature> {
		let mut state = self.lock();
		state.stats.send_attempts += 1;
		state.take_fault(Operation::SendTransaction)?;

		if transaction.verify().is_err() {
			return Err(HarnessError::TerminalSubmission(TerminalReason::InvalidSignature));
		}
		let signature = transaction.signatures[0];
		let height = state.block_height;
		match state.blockhashes.get(&transaction.message.recent_blockhash) {
			Some(last_valid) if height <= *last_valid => {}
			_ => return Err(HarnessError::TerminalSubmission(TerminalReason::ValidityMarkerExpired)),
		}
		if state.signatures.contains_key(&signature) {
			return Ok(signature);
		}

		if self.config.drop_accepted {
			debug!(%signature, "simulated cluster dropped transaction");
			return Ok(signature);
		}
		self.execute(&mut state, transaction)?;
		state.signatures.insert(signature, SignatureRecord { polls: 0 });
		debug!(%signature, "simulated cluster applied transaction");
		Ok(signature)
	}

	async fn signature_status(&self, signature: &Signature) -> HarnessResult<SignatureStatus> {
		let _guard = PollGuard::enter(&self.in_flight_polls);
		if let Some(latency) = self.config.status_latency {
			tokio::time::sleep(latency).await;
		}
		let mut state = self.lock();
		state.stats.status_polls += 1;
		state.block_height += self.config.blocks_per_poll;
		state.take_fault(Operation::SignatureStatus)?;
		let Some(record) = state.signatures.get_mut(signature) else {
			return Ok(SignatureStatus::Unknown);
		};
		record.polls += 1;
		Ok(if self.config.never_confirm {
			SignatureStatus::Processed
		} else if record.polls >= self.config.polls_to_finalize {
			SignatureStatus::Finalized
		} else if record.polls >= self.config.polls_to_confirm {
			SignatureStatus::Confirmed
		} else {
			SignatureStatus::Processed
		})
	}

	async fn block_height(&self) -> HarnessResult<u64> {
		let mut state = self.lock();
		state.stats.height_reads += 1;
		state.take_fault(Operation::BlockHeight)?;
		Ok(state.block_height)
	}

	async fn account(&self, address: &Pubkey) -> HarnessResult<Option<Account>> {
		let mut state = self.lock();
		state.stats.account_reads += 1;
		state.take_fault(Operation::Account)?;
		Ok(state.accounts.get(address).cloned())
	}

	async fn request_airdrop(&self, to: &Pubkey, lamports: u64) -> HarnessResult<Signature> {
		let mut state = self.lock();
		state.stats.airdrops += 1;
		state.take_fault(Operation::RequestAirdrop)?;
		let account = state.accounts.entry(*to).or_insert_with(|| Account::new(0, 0, &system_program::id()));
		account.lamports = account.lamports.saturating_add(lamports);
		let signature = Signature::new_unique();
		state.signatures.insert(signature, SignatureRecord { polls: 0 });
		Ok(signature)
	}
}
