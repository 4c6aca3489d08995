// Shared fixtures for the integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hello_anchor_harness::{
    builder::{build, AccountRef, PreparedTransaction, ValidityMarker},
    cluster::{simulated::SimulatedConfig, ClusterRpc, InvocationContext, SignatureStatus, SimulatedCluster},
    config::{HarnessConfig, LAMPORTS_PER_SOL},
    engine::{SubmissionEngine, SubmitPolicy, TargetCommitment},
    error::HarnessResult,
    identity::{Identity, IdentityGenerator},
    idl::{account_discriminator, instruction_discriminator, ProgramInterface},
    orchestrator::Harness,
    suite::BIDS_SEED,
};
use mockall::mock;
use solana_sdk::{
    account::Account,
    hash::Hash,
    instruction::InstructionError,
    pubkey::Pubkey,
    signature::Signature,
    system_instruction::SystemInstruction,
    system_program,
    transaction::Transaction,
};

/// Rent the simulated program charges for the bids account.
pub const BIDS_ACCOUNT_LAMPORTS: u64 = 1_500_000;

// Anchor's "fallback instruction not found".
pub const INSTRUCTION_NOT_FOUND: u32 = 101;

mock! {
    pub Rpc {}

    #[async_trait]
    impl ClusterRpc for Rpc {
        async fn latest_validity_marker(&self) -> HarnessResult<ValidityMarker>;
        async fn send_transaction(&self, transaction: &Transaction) -> HarnessResult<Signature>;
        async fn signature_status(&self, signature: &Signature) -> HarnessResult<SignatureStatus>;
        async fn block_height(&self) -> HarnessResult<u64>;
        async fn account(&self, address: &Pubkey) -> HarnessResult<Option<Account>>;
        async fn request_airdrop(&self, to: &Pubkey, lamports: u64) -> HarnessResult<Signature>;
    }
}

pub struct TestContext {
    pub cluster: SimulatedCluster,
    pub iface: ProgramInterface,
    pub program_id: Pubkey,
    /// Accepts any instruction and changes nothing.
    pub noop_program: Pubkey,
    pub generator: IdentityGenerator,
}

impl TestContext {
    /// Simulated cluster with the bids program and the system program deployed.
    pub fn new() -> Self {
        Self::with_config(SimulatedConfig::default())
    }

    pub fn with_config(config: SimulatedConfig) -> Self {
        let iface = ProgramInterface::hello_anchor().expect("builtin interface parses");
        let program_id = iface.program_id().expect("builtin interface has an address");
        let cluster = SimulatedCluster::with_config(config);
        cluster.register_program(program_id, bids_program);
        cluster.register_program(system_program::id(), system_transfer);
        let noop_program = Pubkey::new_unique();
        cluster.register_program(noop_program, noop);
        Self { cluster, iface, program_id, noop_program, generator: IdentityGenerator::new() }
    }

    pub fn rpc(&self) -> Arc<dyn ClusterRpc> {
        Arc::new(self.cluster.clone())
    }

    pub fn engine(&self, policy: SubmitPolicy) -> SubmissionEngine {
        SubmissionEngine::new(self.rpc(), policy)
    }

    pub fn harness(&self, config: HarnessConfig) -> Harness {
        Harness::new(self.rpc(), self.iface.clone(), config)
    }

    /// A fresh identity credited directly on the ledger.
    pub async fn funded_identity(&self, lamports: u64) -> Identity {
        let identity = self.generator.new_identity();
        self.cluster.request_airdrop(&identity.pubkey(), lamports).await.expect("airdrop");
        identity
    }

    /// Payer-only transaction for the no-op program.
    pub async fn payer_transaction(&self, payer: &Identity, data: Vec<u8>) -> PreparedTransaction {
        let marker = self.cluster.latest_validity_marker().await.expect("marker");
        build(self.noop_program, vec![AccountRef::writable_signer(payer)], data, payer, marker).expect("build")
    }

    pub fn bids_address(&self) -> (Pubkey, u8) {
        self.iface.pda("initialize", "bids", &HashMap::new()).expect("bids pda")
    }
}

pub fn test_config() -> HarnessConfig {
    HarnessConfig {
        default_timeout_ms: 10_000,
        poll_interval_ms: 100,
        backoff_base_ms: 100,
        backoff_max_ms: 1_000,
        airdrop_lamports: LAMPORTS_PER_SOL,
        ..HarnessConfig::default()
    }
}

pub fn test_policy() -> SubmitPolicy {
    SubmitPolicy {
        timeout: Duration::from_secs(10),
        poll_interval: Duration::from_millis(100),
        max_retries: 3,
        backoff_base: Duration::from_millis(100),
        backoff_max: Duration::from_millis(1_000),
        commitment: TargetCommitment::Confirmed,
    }
}

pub fn unsent_marker() -> ValidityMarker {
    ValidityMarker { blockhash: Hash::new_unique(), last_valid_block_height: 1_000 }
}

pub fn noop(_: &InvocationContext, _: &mut HashMap<Pubkey, Account>) -> Result<(), InstructionError> {
    Ok(())
}

/// The bids program's `initialize`: creates the `bid1` PDA holding an empty
/// `AllBids` with the caller as admin. Every other instruction is unknown.
pub fn bids_program(ctx: &InvocationContext, accounts: &mut HashMap<Pubkey, Account>) -> Result<(), InstructionError> {
    if ctx.data.len() < 8 || ctx.data[..8] != instruction_discriminator("initialize") {
        return Err(InstructionError::Custom(INSTRUCTION_NOT_FOUND));
    }
    let [user, bids, ..] = ctx.accounts.as_slice() else {
        return Err(InstructionError::NotEnoughAccountKeys);
    };
    if !user.is_signer {
        return Err(InstructionError::MissingRequiredSignature);
    }
    let (expected, bump) = Pubkey::find_program_address(&[BIDS_SEED.as_bytes()], &ctx.program_id);
    if bids.pubkey != expected {
        return Err(InstructionError::InvalidSeeds);
    }
    if accounts.get(&bids.pubkey).map(|a| a.lamports > 0).unwrap_or(false) {
        return Err(InstructionError::AccountAlreadyInitialized);
    }
    let payer = accounts.get_mut(&user.pubkey).ok_or(InstructionError::InsufficientFunds)?;
    if payer.lamports < BIDS_ACCOUNT_LAMPORTS {
        return Err(InstructionError::InsufficientFunds);
    }
    payer.lamports -= BIDS_ACCOUNT_LAMPORTS;

    let mut data = account_discriminator("AllBids").to_vec();
    data.extend_from_slice(&0u64.to_le_bytes());
    data.push(bump);
    data.extend_from_slice(&0u32.to_le_bytes());
    data.extend_from_slice(user.pubkey.as_ref());
    // Anchor allocates the full space up front; the tail stays zeroed.
    data.resize(data.len() + 64, 0);
    accounts.insert(bids.pubkey, Account { lamports: BIDS_ACCOUNT_LAMPORTS, data, owner: ctx.program_id, ..Account::default() });
    Ok(())
}

/// Turns its first (signer) account into a `NewAccount { data: 0 }` owned by
/// the program.
pub fn new_account_program(ctx: &InvocationContext, accounts: &mut HashMap<Pubkey, Account>) -> Result<(), InstructionError> {
    let target = ctx.accounts.first().ok_or(InstructionError::NotEnoughAccountKeys)?;
    if !target.is_signer || !target.is_writable {
        return Err(InstructionError::MissingRequiredSignature);
    }
    let account = accounts.get_mut(&target.pubkey).ok_or(InstructionError::UninitializedAccount)?;
    let mut data = account_discriminator("NewAccount").to_vec();
    data.extend_from_slice(&0u64.to_le_bytes());
    account.owner = ctx.program_id;
    account.data = data;
    Ok(())
}

pub fn system_transfer(ctx: &InvocationContext, accounts: &mut HashMap<Pubkey, Account>) -> Result<(), InstructionError> {
    let Ok(SystemInstruction::Transfer { lamports }) = bincode::deserialize::<SystemInstruction>(&ctx.data) else {
        return Err(InstructionError::InvalidInstructionData);
    };
    let [from, to, ..] = ctx.accounts.as_slice() else {
        return Err(InstructionError::NotEnoughAccountKeys);
    };
    let source = accounts.get_mut(&from.pubkey).ok_or(InstructionError::InsufficientFunds)?;
    if source.lamports < lamports {
        return Err(InstructionError::InsufficientFunds);
    }
    source.lamports -= lamports;
    let dest = accounts.entry(to.pubkey).or_insert_with(|| Account::new(0, 0, &system_program::id()));
    dest.lamports += lamports;
    Ok(())
}
