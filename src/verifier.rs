use std::sync::Arc;

use serde::Serialize;
use solana_sdk::{account::Account, pubkey::Pubkey};
use tracing::debug;

use crate::cluster::ClusterRpc;
use crate::codec::{decode_account, Value};
use crate::error::{HarnessError, HarnessResult};
use crate::idl::ProgramInterface;

/// An account as read from the cluster at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSnapshot {
	pub address: Pubkey,
	pub owner: Pubkey,
	pub lamports: u64,
	pub data: Vec<u8>,
	pub exists: bool,
}

impl AccountSnapshot {
	pub fn from_account(address: Pubkey, account: Account) -> Self {
		Self { address, owner: account.owner, lamports: account.lamports, data: account.data, exists: true }
	}

	pub fn missing(address: Pubkey) -> Self {
		Self { address, owner: Pubkey::default(), lamports: 0, data: Vec::new(), exists: false }
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDiff {
	pub path: String,
	pub expected: String,
	pub actual: String,
}

impl FieldDiff {
	fn new(path: impl Into<String>, expected: impl ToString, actual: impl ToString) -> Self {
		Self { path: path.into(), expected: expected.to_string(), actual: actual.to_string() }
	}
}

/// What an account should look like. Unset parts are not compared.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpectedAccount {
	exists: bool,
	owner: Option<Pubkey>,
	min_lamports: Option<u64>,
	account_type: Option<String>,
	fields: Vec<(String, Value)>,
}

impl Default for ExpectedAccount {
	fn default() -> Self {
		Self::new()
	}
}

impl ExpectedAccount {
	pub fn new() -> Self {
		Self { exists: true, owner: None, min_lamports: None, account_type: None, fields: Vec::new() }
	}

	pub fn absent() -> Self {
		Self { exists: false, ..Self::new() }
	}

	pub fn owner(mut self, owner: Pubkey) -> Self {
		self.owner = Some(owner);
		self
	}

	pub fn min_lamports(mut self, lamports: u64) -> Self {
		self.min_lamports = Some(lamports);
		self
	}

	/// Account type used to decode the data before field comparison.
	pub fn decoded_as(mut self, account_type: impl Into<String>) -> Self {
		self.account_type = Some(account_type.into());
		self
	}

	/// `path` uses the form accepted by [`Value::get_path`].
	pub fn field(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
		self.fields.push((path.into(), value.into()));
		self
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
	Pass,
	Fail(Vec<FieldDiff>),
}

impl Verdict {
	pub fn is_pass(&self) -> bool {
		matches!(self, Verdict::Pass)
	}

	pub fn into_result(self) -> HarnessResult<()> {
		match self {
			Verdict::Pass => Ok(()),
			Verdict::Fail(diff) => Err(HarnessError::VerificationFailed(diff)),
		}
	}
}

/// Read-only view of cluster state. Nothing here writes, so calls can be
/// repeated freely and give the same answer while the ledger is unchanged.
#[derive(Clone)]
pub struct StateVerifier {
	cluster: Arc<dyn ClusterRpc>,
	iface: Arc<ProgramInterface>,
}

impl StateVerifier {
	pub fn new(cluster: Arc<dyn ClusterRpc>, iface: Arc<ProgramInterface>) -> Self {
		Self { cluster, iface }
	}

	pub async fn fetch(&self, address: &Pubkey) -> HarnessResult<AccountSnapshot> {
		let snapshot = self.fetch_optional(address).await?;
		if !snapshot.exists {
			return Err(HarnessError::AccountNotFound(*address));
		}
		Ok(snapshot)
	}

	pub async fn fetch_optional(&self, address: &Pubkey) -> HarnessResult<AccountSnapshot> {
		let snapshot = match self.cluster.account(address).await? {
			Some(account) => AccountSnapshot::from_account(*address, account),
			None => AccountSnapshot::missing(*address),
		};
		debug!(%address, exists = snapshot.exists, lamports = snapshot.lamports, "fetched account");
		Ok(snapshot)
	}

	pub fn decode(&self, snapshot: &AccountSnapshot, account_type: &str) -> HarnessResult<Value> {
		if !snapshot.exists {
			return Err(HarnessError::AccountNotFound(snapshot.address));
		}
		decode_account(&self.iface, account_type, &snapshot.data)
	}

	/// Compares a snapshot against `expected`. Data that cannot be decoded
	/// as the expected type is an error, not a diff.
	pub fn assert_equals(&self, snapshot: &AccountSnapshot, expected: &ExpectedAccount) -> HarnessResult<Verdict> {
		if snapshot.exists != expected.exists {
			return Ok(Verdict::Fail(vec![FieldDiff::new("exists", expected.exists, snapshot.exists)]));
		}
		if !snapshot.exists {
			return Ok(Verdict::Pass);
		}

		let mut diff = Vec::new();
		if let Some(owner) = expected.owner {
			if owner != snapshot.owner {
				diff.push(FieldDiff::new("owner", owner, snapshot.owner));
			}
		}
		if let Some(min) = expected.min_lamports {
			if snapshot.lamports < min {
				diff.push(FieldDiff::new("lamports", format!(">= {min}"), snapshot.lamports));
			}
		}

		match &expected.account_type {
			Some(account_type) => {
				let decoded = self.decode(snapshot, account_type)?;
				for (path, want) in &expected.fields {
					match decoded.get_path(path) {
						Some(got) if want.matches(got) => {}
						Some(got) => diff.push(FieldDiff::new(path.as_str(), want, got)),
						None => diff.push(FieldDiff::new(path.as_str(), want, "<missing>")),
					}
				}
			}
			None if !expected.fields.is_empty() => {
				return Err(HarnessError::Config("field expectations need an account type to decode with".into()));
			}
			None => {}
		}

		Ok(if diff.is_empty() { Verdict::Pass } else { Verdict::Fail(diff) })
	}

	/// Fetch, compare and turn a failing verdict into `VerificationFailed`.
	pub async fn expect(&self, address: &Pubkey, expected: &ExpectedAccount) -> HarnessResult<AccountSnapshot> {
		let snapshot = self.fetch_optional(address).await?;
		self.assert_equals(&snapshot, expected)?.into_result()?;
		Ok(snapshot)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::cluster::SimulatedCluster;
	use crate::codec::encode_account;
	use std::collections::BTreeMap;

	fn all_bids(iface: &ProgramInterface, admin: Pubkey, total: u64) -> Vec<u8> {
		let mut fields = BTreeMap::new();
		fields.insert("totalBids".to_string(), Value::from(total));
		fields.insert("bump".to_string(), Value::from(254u8));
		fields.insert("bidsList".to_string(), Value::Vec(vec![]));
		fields.insert("admin".to_string(), Value::from(admin));
		encode_account(iface, "AllBids", &Value::Struct(fields)).unwrap()
	}

	fn setup() -> (SimulatedCluster, StateVerifier, Pubkey, Pubkey) {
		let iface = Arc::new(ProgramInterface::hello_anchor().unwrap());
		let program = iface.program_id().unwrap();
		let cluster = SimulatedCluster::new();
		let address = Pubkey::new_unique();
		let admin = Pubkey::new_unique();
		let mut account = Account::new(2_000_000, 0, &program);
		account.data = all_bids(&iface, admin, 0);
		cluster.set_account(address, account);
		let verifier = StateVerifier::new(Arc::new(cluster.clone()), iface);
		(cluster, verifier, address, admin)
	}

	#[tokio::test]
	async fn reports_each_differing_field() {
		let (_cluster, verifier, address, admin) = setup();
		let snapshot = verifier.fetch(&address).await.unwrap();
		let expected = ExpectedAccount::new()
			.owner(Pubkey::new_unique())
			.decoded_as("AllBids")
			.field("totalBids", 3u64)
			.field("admin", admin)
			.field("bidsList[0].url", "missing");

		match verifier.assert_equals(&snapshot, &expected).unwrap() {
			Verdict::Fail(diff) => {
				let paths: Vec<_> = diff.iter().map(|d| d.path.as_str()).collect();
				assert_eq!(paths, vec!["owner", "totalBids", "bidsList[0].url"]);
				assert_eq!(diff[1].expected, "3");
				assert_eq!(diff[1].actual, "0");
				assert_eq!(diff[2].actual, "<missing>");
			}
			Verdict::Pass => panic!("expected differences"),
		}
	}

	#[tokio::test]
	async fn missing_account() {
		let (_cluster, verifier, _, _) = setup();
		let nowhere = Pubkey::new_unique();
		assert_eq!(verifier.fetch(&nowhere).await.unwrap_err(), HarnessError::AccountNotFound(nowhere));

		let snapshot = verifier.fetch_optional(&nowhere).await.unwrap();
		assert!(!snapshot.exists);
		assert!(verifier.assert_equals(&snapshot, &ExpectedAccount::absent()).unwrap().is_pass());
		assert!(!verifier.assert_equals(&snapshot, &ExpectedAccount::new()).unwrap().is_pass());
	}

	#[tokio::test]
	async fn undecodable_data_is_a_schema_error() {
		let (cluster, verifier, _, _) = setup();
		let address = Pubkey::new_unique();
		cluster.set_account(address, Account { lamports: 1, data: vec![9; 12], ..Account::default() });
		let snapshot = verifier.fetch(&address).await.unwrap();
		let err = verifier.assert_equals(&snapshot, &ExpectedAccount::new().decoded_as("AllBids")).unwrap_err();
		assert!(matches!(err, HarnessError::SchemaMismatch { .. }));
	}

	#[tokio::test]
	async fn fields_without_type_are_rejected() {
		let (_cluster, verifier, address, _) = setup();
		let snapshot = verifier.fetch(&address).await.unwrap();
		let err = verifier.assert_equals(&snapshot, &ExpectedAccount::new().field("totalBids", 0u64)).unwrap_err();
		assert!(matches!(err, HarnessError::Config(_)));
	}
}
