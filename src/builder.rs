use solana_sdk::{
	hash::Hash,
	instruction::{AccountMeta, Instruction},
	message::Message,
	packet::PACKET_DATA_SIZE,
	pubkey::Pubkey,
	signature::{Keypair, Signature},
	transaction::Transaction,
};
use tracing::debug;

use crate::codec::{encode_instruction_data, Value};
use crate::error::{HarnessError, HarnessResult};
use crate::identity::Identity;
use crate::idl::ProgramInterface;

/// Largest serialized transaction the cluster accepts.
pub const MAX_TRANSACTION_SIZE: usize = PACKET_DATA_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
	Signer,
	WritableSigner,
	Writable,
	Readonly,
}

impl Role {
	pub fn from_flags(is_signer: bool, is_writable: bool) -> Self {
		match (is_signer, is_writable) {
			(true, true) => Role::WritableSigner,
			(true, false) => Role::Signer,
			(false, true) => Role::Writable,
			(false, false) => Role::Readonly,
		}
	}

	pub fn is_signer(self) -> bool {
		matches!(self, Role::Signer | Role::WritableSigner)
	}

	pub fn is_writable(self) -> bool {
		matches!(self, Role::Writable | Role::WritableSigner)
	}
}

#[derive(Debug, Clone)]
pub enum AccountKey {
	Identity(Identity),
	Address(Pubkey),
}

impl AccountKey {
	pub fn pubkey(&self) -> Pubkey {
		match self {
			AccountKey::Identity(id) => id.pubkey(),
			AccountKey::Address(key) => *key,
		}
	}
}

#[derive(Debug, Clone)]
pub struct AccountRef {
	pub key: AccountKey,
	pub role: Role,
	/// Created by this transaction rather than expected to exist already.
	pub created: bool,
}

impl AccountRef {
	pub fn new(key: AccountKey, role: Role) -> Self {
		Self { key, role, created: false }
	}

	pub fn signer(identity: &Identity) -> Self {
		Self::new(AccountKey::Identity(identity.clone()), Role::Signer)
	}

	pub fn writable_signer(identity: &Identity) -> Self {
		Self::new(AccountKey::Identity(identity.clone()), Role::WritableSigner)
	}

	pub fn writable(address: Pubkey) -> Self {
		Self::new(AccountKey::Address(address), Role::Writable)
	}

	pub fn readonly(address: Pubkey) -> Self {
		Self::new(AccountKey::Address(address), Role::Readonly)
	}

	/// A signer whose private key is held elsewhere.
	pub fn external_signer(address: Pubkey, writable: bool) -> Self {
		Self::new(AccountKey::Address(address), Role::from_flags(true, writable))
	}

	pub fn created(mut self) -> Self {
		self.created = true;
		self
	}

	pub fn pubkey(&self) -> Pubkey {
		self.key.pubkey()
	}

	fn meta(&self) -> AccountMeta {
		if self.role.is_writable() {
			AccountMeta::new(self.pubkey(), self.role.is_signer())
		} else {
			AccountMeta::new_readonly(self.pubkey(), self.role.is_signer())
		}
	}
}

/// Recent blockhash plus the last block height at which it is still
/// accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidityMarker {
	pub blockhash: Hash,
	pub last_valid_block_height: u64,
}

#[derive(Debug, Clone)]
pub struct Invocation {
	pub name: Option<String>,
	pub program_id: Pubkey,
	pub accounts: Vec<AccountRef>,
	pub data: Vec<u8>,
}

impl Invocation {
	pub fn new(program_id: Pubkey, accounts: Vec<AccountRef>, data: Vec<u8>) -> Self {
		Self { name: None, program_id, accounts, data }
	}

	/// Resolves `name` in the interface, orders `accounts` as declared and
	/// checks every supplied role against the declared signer/mut flags.
	pub fn from_interface(
		iface: &ProgramInterface,
		name: &str,
		accounts: &[(&str, AccountRef)],
		args: &[(&str, Value)],
	) -> HarnessResult<Self> {
		let ix = iface.instruction(name)?;
		for (supplied, _) in accounts {
			if !ix.accounts.iter().any(|a| a.name == *supplied) {
				return Err(HarnessError::malformed(format!("{} has no account {supplied}", ix.name)));
			}
		}

		let mut ordered = Vec::with_capacity(ix.accounts.len());
		for declared in &ix.accounts {
			let account = accounts
				.iter()
				.find(|(n, _)| *n == declared.name)
				.map(|(_, a)| a.clone())
				.ok_or_else(|| HarnessError::malformed(format!("{} is missing account {}", ix.name, declared.name)))?;
			if account.role.is_signer() != declared.is_signer || account.role.is_writable() != declared.is_mut {
				return Err(HarnessError::malformed(format!(
					"{}.{} declared signer={} mut={} but supplied as {:?}",
					ix.name, declared.name, declared.is_signer, declared.is_mut, account.role
				)));
			}
			ordered.push(account);
		}

		let data = encode_instruction_data(iface, ix, args)?;
		Ok(Self { name: Some(ix.name.clone()), program_id: iface.program_id()?, accounts: ordered, data })
	}

	/// Static checks that need no cluster state.
	pub fn validate(&self) -> HarnessResult<()> {
		let label = self.name.as_deref().unwrap_or("instruction");
		if self.accounts.is_empty() {
			return Err(HarnessError::malformed(format!("{label} references no accounts")));
		}
		if self.data.len() > MAX_TRANSACTION_SIZE {
			return Err(HarnessError::malformed(format!(
				"{label} argument payload is {} bytes, limit is {MAX_TRANSACTION_SIZE}",
				self.data.len()
			)));
		}
		if let Some(account) = self.accounts.iter().find(|a| a.created && !a.role.is_writable()) {
			return Err(HarnessError::malformed(format!(
				"{label}: account {} is created in this transaction but not writable",
				account.pubkey()
			)));
		}
		for (i, a) in self.accounts.iter().enumerate() {
			for b in &self.accounts[i + 1..] {
				if a.pubkey() == b.pubkey() && a.role.is_signer() != b.role.is_signer() {
					return Err(HarnessError::malformed(format!(
						"{label}: account {} is referenced both as signer and non-signer",
						a.pubkey()
					)));
				}
			}
		}
		Ok(())
	}

	fn instruction(&self) -> Instruction {
		Instruction {
			program_id: self.program_id,
			accounts: self.accounts.iter().map(AccountRef::meta).collect(),
			data: self.data.clone(),
		}
	}
}

/// A built transaction, signed by every identity the caller holds.
#[derive(Debug, Clone)]
pub struct PreparedTransaction {
	pub transaction: Transaction,
	pub marker: ValidityMarker,
	pub missing_signers: Vec<Pubkey>,
}

impl PreparedTransaction {
	pub fn is_fully_signed(&self) -> bool {
		self.missing_signers.is_empty()
	}

	/// The fee payer's signature, which identifies the transaction.
	pub fn signature(&self) -> Signature {
		self.transaction.signatures.first().copied().unwrap_or_default()
	}

	pub fn serialized_size(&self) -> HarnessResult<usize> {
		bincode::serialized_size(&self.transaction)
			.map(|n| n as usize)
			.map_err(|e| HarnessError::Internal(format!("serialize tx: {e}")))
	}

	/// Adds a co-signer's signature to a partially signed transaction.
	pub fn sign_with(&mut self, identity: &Identity) -> HarnessResult<()> {
		let pubkey = identity.pubkey();
		if !self.missing_signers.contains(&pubkey) {
			return Err(HarnessError::malformed(format!("{pubkey} is not an outstanding signer")));
		}
		self.transaction
			.try_partial_sign(&[identity.keypair()], self.marker.blockhash)
			.map_err(|e| HarnessError::malformed(format!("signing failed: {e}")))?;
		self.missing_signers.retain(|k| *k != pubkey);
		Ok(())
	}
}

pub struct TransactionBuilder {
	payer: Identity,
	invocations: Vec<Invocation>,
}

impl TransactionBuilder {
	pub fn new(payer: &Identity) -> Self {
		Self { payer: payer.clone(), invocations: Vec::new() }
	}

	/// Invocations execute in the order they are added.
	pub fn invoke(mut self, invocation: Invocation) -> Self {
		self.invocations.push(invocation);
		self
	}

	pub fn build(self, marker: ValidityMarker) -> HarnessResult<PreparedTransaction> {
		if self.invocations.is_empty() {
			return Err(HarnessError::malformed("transaction has no instructions"));
		}
		let payer = self.payer.pubkey();
		for invocation in &self.invocations {
			invocation.validate()?;
			if invocation.accounts.iter().any(|a| a.pubkey() == payer && !a.role.is_signer()) {
				return Err(HarnessError::malformed(format!("fee payer {payer} is referenced as a non-signer")));
			}
		}

		let instructions: Vec<Instruction> = self.invocations.iter().map(Invocation::instruction).collect();
		let message = Message::new_with_blockhash(&instructions, Some(&payer), &marker.blockhash);
		let mut transaction = Transaction::new_unsigned(message);

		let mut held: Vec<&Identity> = vec![&self.payer];
		let mut missing_signers = Vec::new();
		for account in self.invocations.iter().flat_map(|i| i.accounts.iter()).filter(|a| a.role.is_signer()) {
			match &account.key {
				AccountKey::Identity(id) => {
					if !held.iter().any(|h| h.pubkey() == id.pubkey()) {
						held.push(id);
					}
				}
				AccountKey::Address(key) => {
					if *key != payer && !missing_signers.contains(key) && !held.iter().any(|h| h.pubkey() == *key) {
						missing_signers.push(*key);
					}
				}
			}
		}
		// an address-only signer may also have been supplied as an identity elsewhere
		missing_signers.retain(|k| !held.iter().any(|h| h.pubkey() == *k));

		let keypairs: Vec<&Keypair> = held.iter().map(|id| id.keypair()).collect();
		transaction
			.try_partial_sign(keypairs.as_slice(), marker.blockhash)
			.map_err(|e| HarnessError::malformed(format!("signing failed: {e}")))?;

		let prepared = PreparedTransaction { transaction, marker, missing_signers };
		let size = prepared.serialized_size()?;
		if size > MAX_TRANSACTION_SIZE {
			return Err(HarnessError::malformed(format!(
				"transaction is {size} bytes, limit is {MAX_TRANSACTION_SIZE}"
			)));
		}
		debug!(signature = %prepared.signature(), size, instructions = instructions.len(), "built transaction");
		Ok(prepared)
	}
}

/// Single-invocation shorthand for [`TransactionBuilder`].
pub fn build(
	program_id: Pubkey,
	accounts: Vec<AccountRef>,
	args: Vec<u8>,
	payer: &Identity,
	marker: ValidityMarker,
) -> HarnessResult<PreparedTransaction> {
	TransactionBuilder::new(payer).invoke(Invocation::new(program_id, accounts, args)).build(marker)
}
