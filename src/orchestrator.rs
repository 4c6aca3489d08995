//! Runs an explicit, ordered list of test cases against a shared cluster.
//!
//! Each case executes inside its own tokio task, so a panic or error stays
//! with the case that caused it. Teardown runs in a separate task after the
//! body finished, failed, panicked or timed out.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use solana_sdk::{pubkey::Pubkey, system_instruction};
use tokio::task::JoinError;
use tokio::time::Instant;
use tracing::{info, info_span, warn, Instrument};

use crate::builder::{AccountRef, Invocation, PreparedTransaction, TransactionBuilder, ValidityMarker};
use crate::cluster::ClusterRpc;
use crate::codec::Value;
use crate::config::HarnessConfig;
use crate::engine::{ConfirmationResult, Submission, SubmissionEngine, TargetCommitment};
use crate::error::{ErrorKind, HarnessError, HarnessResult, TerminalReason};
use crate::identity::{Identity, IdentityGenerator};
use crate::idl::ProgramInterface;
use crate::report::{CaseOutcome, CaseReport, Report};
use crate::verifier::{AccountSnapshot, ExpectedAccount, StateVerifier};

pub type CaseFn = Arc<dyn Fn(CaseContext) -> BoxFuture<'static, HarnessResult<()>> + Send + Sync>;

fn boxed<F, Fut>(f: F) -> CaseFn
where
	F: Fn(CaseContext) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = HarnessResult<()>> + Send + 'static,
{
	Arc::new(move |ctx| f(ctx).boxed())
}

#[derive(Clone)]
pub struct TestCase {
	pub name: String,
	setup: Option<CaseFn>,
	body: CaseFn,
	teardown: Option<CaseFn>,
	expectation: Option<ErrorKind>,
	timeout: Option<Duration>,
}

impl TestCase {
	pub fn new<F, Fut>(name: impl Into<String>, body: F) -> Self
	where
		F: Fn(CaseContext) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = HarnessResult<()>> + Send + 'static,
	{
		Self { name: name.into(), setup: None, body: boxed(body), teardown: None, expectation: None, timeout: None }
	}

	pub fn setup<F, Fut>(mut self, f: F) -> Self
	where
		F: Fn(CaseContext) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = HarnessResult<()>> + Send + 'static,
	{
		self.setup = Some(boxed(f));
		self
	}

	pub fn teardown<F, Fut>(mut self, f: F) -> Self
	where
		F: Fn(CaseContext) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = HarnessResult<()>> + Send + 'static,
	{
		self.teardown = Some(boxed(f));
		self
	}

	/// The case passes only if it fails with an error of this kind.
	pub fn expect_failure(mut self, kind: ErrorKind) -> Self {
		self.expectation = Some(kind);
		self
	}

	/// Overrides the run-wide per-case timeout.
	pub fn timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}

	pub fn expectation(&self) -> Option<ErrorKind> {
		self.expectation
	}
}

/// Everything cases share: one cluster connection, the engine and verifier
/// on top of it, and the program interface.
#[derive(Clone)]
pub struct Harness {
	cluster: Arc<dyn ClusterRpc>,
	engine: SubmissionEngine,
	verifier: StateVerifier,
	iface: Arc<ProgramInterface>,
	generator: IdentityGenerator,
	wallet: Option<Identity>,
	config: HarnessConfig,
}

impl Harness {
	pub fn new(cluster: Arc<dyn ClusterRpc>, iface: ProgramInterface, config: HarnessConfig) -> Self {
		let iface = Arc::new(iface);
		Self {
			engine: SubmissionEngine::new(cluster.clone(), config.submit_policy()),
			verifier: StateVerifier::new(cluster.clone(), iface.clone()),
			cluster,
			iface,
			generator: IdentityGenerator::new(),
			wallet: None,
			config,
		}
	}

	/// Funds generated identities by transfer from `wallet` instead of by
	/// airdrop.
	pub fn with_wallet(mut self, wallet: Identity) -> Self {
		self.wallet = Some(wallet);
		self
	}

	pub fn config(&self) -> &HarnessConfig {
		&self.config
	}

	pub fn interface(&self) -> &ProgramInterface {
		&self.iface
	}

	pub fn generator(&self) -> &IdentityGenerator {
		&self.generator
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaseStats {
	pub submissions: u32,
	pub retries: u32,
	pub polls: u32,
}

/// Per-case handle passed to setup, body and teardown. Clones share the
/// case's identities and statistics.
#[derive(Clone)]
pub struct CaseContext {
	case: Arc<str>,
	harness: Harness,
	identities: Arc<Mutex<HashMap<String, Identity>>>,
	stats: Arc<Mutex<CaseStats>>,
}

impl CaseContext {
	pub fn new(case: &str, harness: Harness) -> Self {
		Self {
			case: Arc::from(case),
			harness,
			identities: Arc::default(),
			stats: Arc::default(),
		}
	}

	pub fn case_name(&self) -> &str {
		&self.case
	}

	pub fn interface(&self) -> &ProgramInterface {
		&self.harness.iface
	}

	pub fn program_id(&self) -> HarnessResult<Pubkey> {
		self.harness.iface.program_id()
	}

	pub fn engine(&self) -> &SubmissionEngine {
		&self.harness.engine
	}

	pub fn verifier(&self) -> &StateVerifier {
		&self.harness.verifier
	}

	/// A view of this case whose submissions wait for `commitment`.
	pub fn with_commitment(&self, commitment: TargetCommitment) -> Self {
		let mut ctx = self.clone();
		ctx.harness.engine = self.harness.engine.with_commitment(commitment);
		ctx
	}

	pub fn stats(&self) -> CaseStats {
		*lock(&self.stats)
	}

	/// A fresh identity, remembered under `label` for the rest of the case.
	pub fn new_identity(&self, label: &str) -> Identity {
		let identity = self.harness.generator.new_identity();
		lock(&self.identities).insert(label.to_string(), identity.clone());
		identity
	}

	pub fn identity(&self, label: &str) -> HarnessResult<Identity> {
		lock(&self.identities)
			.get(label)
			.cloned()
			.ok_or_else(|| HarnessError::Internal(format!("case {} has no identity {label}", self.case)))
	}

	/// A fresh identity holding the configured airdrop amount.
	pub async fn funded_identity(&self, label: &str) -> HarnessResult<Identity> {
		let identity = self.new_identity(label);
		self.fund(&identity.pubkey(), self.harness.config.airdrop_lamports).await?;
		Ok(identity)
	}

	pub async fn fund(&self, to: &Pubkey, lamports: u64) -> HarnessResult<()> {
		let submission = match &self.harness.wallet {
			Some(wallet) => {
				let transfer = system_instruction::transfer(&wallet.pubkey(), to, lamports);
				let invocation = Invocation::new(
					transfer.program_id,
					vec![AccountRef::writable_signer(wallet), AccountRef::writable(*to)],
					transfer.data,
				);
				let marker = self.latest_marker().await?;
				let tx = TransactionBuilder::new(wallet).invoke(invocation).build(marker)?;
				self.harness.engine.submit(&tx).await
			}
			None => self.harness.engine.fund(to, lamports).await?,
		};
		self.record(&submission);
		submission.result.into_result().map(|_| ())
	}

	pub async fn latest_marker(&self) -> HarnessResult<ValidityMarker> {
		self.harness.cluster.latest_validity_marker().await
	}

	/// Derives a PDA declared on `instruction`.
	pub fn pda(&self, instruction: &str, account: &str, known: &HashMap<String, Pubkey>) -> HarnessResult<(Pubkey, u8)> {
		self.harness.iface.pda(instruction, account, known)
	}

	/// Builds `instruction` from the interface, signs it with a freshly
	/// fetched validity marker and waits for the target commitment. Invalid
	/// invocations are rejected before anything is sent.
	pub async fn invoke(
		&self,
		payer: &Identity,
		instruction: &str,
		accounts: &[(&str, AccountRef)],
		args: &[(&str, Value)],
	) -> HarnessResult<Submission> {
		let invocation = Invocation::from_interface(&self.harness.iface, instruction, accounts, args)?;
		invocation.validate()?;
		let marker = self.latest_marker().await?;
		let tx = TransactionBuilder::new(payer).invoke(invocation).build(marker)?;
		self.submit(&tx).await
	}

	pub async fn submit(&self, tx: &PreparedTransaction) -> HarnessResult<Submission> {
		let submission = self.harness.engine.submit(tx).await;
		self.record(&submission);
		if let ConfirmationResult::Failed(HarnessError::TerminalSubmission(TerminalReason::ProgramError { code, .. })) =
			&submission.result
		{
			if let Some(def) = self.harness.iface.error(*code) {
				warn!(case = %self.case, code, name = %def.name, msg = def.msg.as_deref().unwrap_or(""), "program error");
			}
		}
		submission.result.clone().into_result()?;
		Ok(submission)
	}

	pub async fn fetch(&self, address: &Pubkey) -> HarnessResult<AccountSnapshot> {
		self.harness.verifier.fetch(address).await
	}

	pub async fn fetch_optional(&self, address: &Pubkey) -> HarnessResult<AccountSnapshot> {
		self.harness.verifier.fetch_optional(address).await
	}

	pub fn decode(&self, snapshot: &AccountSnapshot, account_type: &str) -> HarnessResult<Value> {
		self.harness.verifier.decode(snapshot, account_type)
	}

	pub async fn expect_account(&self, address: &Pubkey, expected: &ExpectedAccount) -> HarnessResult<AccountSnapshot> {
		self.harness.verifier.expect(address, expected).await
	}

	fn record(&self, submission: &Submission) {
		let mut stats = lock(&self.stats);
		stats.submissions += 1;
		stats.retries += submission.retries;
		stats.polls += submission.polls;
	}
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
	m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct Orchestrator {
	harness: Harness,
	concurrency: usize,
	case_timeout: Duration,
}

impl Orchestrator {
	pub fn new(harness: Harness) -> Self {
		let concurrency = harness.config.concurrency.max(1);
		let case_timeout = harness.config.case_timeout();
		Self { harness, concurrency, case_timeout }
	}

	pub fn with_concurrency(mut self, concurrency: usize) -> Self {
		self.concurrency = concurrency.max(1);
		self
	}

	/// Runs every case and reports them in list order, whatever order they
	/// finished in.
	pub async fn run(&self, cases: Vec<TestCase>) -> Report {
		let mut report = Report::start();
		info!(run_id = %report.run_id, cases = cases.len(), concurrency = self.concurrency, "starting test run");

		let mut results: Vec<(usize, CaseReport)> = futures::stream::iter(cases.into_iter().enumerate())
			.map(|(index, case)| {
				let harness = self.harness.clone();
				let timeout = case.timeout.unwrap_or(self.case_timeout);
				async move { (index, run_case(harness, case, timeout).await) }
			})
			.buffer_unordered(self.concurrency)
			.collect()
			.await;
		results.sort_by_key(|(index, _)| *index);

		report.finish(results.into_iter().map(|(_, case)| case).collect());
		report.log_summary();
		report
	}
}

async fn run_case(harness: Harness, case: TestCase, timeout: Duration) -> CaseReport {
	let ctx = CaseContext::new(&case.name, harness);
	let span = info_span!("case", case = %case.name);
	let started = Instant::now();

	let setup = case.setup.clone();
	let body = case.body.clone();
	let main_ctx = ctx.clone();
	let main = tokio::spawn(
		async move {
			let steps = async {
				if let Some(setup) = setup {
					setup(main_ctx.clone()).await?;
				}
				body(main_ctx).await
			};
			match tokio::time::timeout(timeout, steps).await {
				Ok(result) => result,
				Err(_) => Err(HarnessError::Timeout(timeout)),
			}
		}
		.instrument(span.clone()),
	);
	let mut result = joined(main.await);

	if let Some(teardown) = case.teardown.clone() {
		let td_ctx = ctx.clone();
		let handle = tokio::spawn(
			async move {
				match tokio::time::timeout(timeout, teardown(td_ctx)).await {
					Ok(result) => result,
					Err(_) => Err(HarnessError::Timeout(timeout)),
				}
			}
			.instrument(span.clone()),
		);
		if let Err(err) = joined(handle.await) {
			warn!(case = %case.name, error = %err, "teardown failed");
			if result.is_ok() {
				result = Err(err);
			}
		}
	}

	let duration = started.elapsed();
	let (outcome, error) = match (result, case.expectation) {
		(Ok(()), None) => (CaseOutcome::Passed, None),
		(Ok(()), Some(kind)) => (CaseOutcome::Failed, Some(HarnessError::UnexpectedSuccess(kind))),
		(Err(err), Some(kind)) if err.kind() == kind => (CaseOutcome::ExpectedFailure, Some(err)),
		(Err(err), _) => (CaseOutcome::Failed, Some(err)),
	};
	match (&outcome, &error) {
		(CaseOutcome::Failed, Some(err)) => {
			warn!(case = %case.name, kind = ?err.kind(), error = %err, ?duration, "case failed")
		}
		_ => info!(case = %case.name, ?outcome, ?duration, "case passed"),
	}
	CaseReport::new(&case.name, outcome, error.as_ref(), duration, ctx.stats())
}

fn joined(res: Result<HarnessResult<()>, JoinError>) -> HarnessResult<()> {
	match res {
		Ok(result) => result,
		Err(err) if err.is_panic() => Err(HarnessError::CasePanicked(panic_message(err.into_panic()))),
		Err(err) => Err(HarnessError::Internal(format!("case task failed: {err}"))),
	}
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
	if let Some(msg) = payload.downcast_ref::<&str>() {
		msg.to_string()
	} else if let Some(msg) = payload.downcast_ref::<String>() {
		msg.clone()
	} else {
		"non-string panic payload".to_string()
	}
}
