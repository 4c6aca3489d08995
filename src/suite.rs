//! Cases for the `hello_anchor` program.

use std::collections::HashMap;

use solana_sdk::system_program;
use tracing::info;

use crate::builder::{AccountRef, MAX_TRANSACTION_SIZE};
use crate::codec::Value;
use crate::engine::{ConfirmationResult, TargetCommitment};
use crate::error::{ErrorKind, HarnessError, HarnessResult};
use crate::orchestrator::{CaseContext, TestCase};
use crate::verifier::ExpectedAccount;

/// Seed of the single auction-list account the program keeps.
pub const BIDS_SEED: &str = "bid1";

pub fn hello_anchor_cases() -> Vec<TestCase> {
	vec![
		TestCase::new("initialize", initialize),
		TestCase::new("add_bid rejects oversized url", add_bid_oversized_url)
			.expect_failure(ErrorKind::MalformedInstruction),
	]
}

/// Creates the bids PDA and checks its initial contents.
pub async fn initialize(ctx: CaseContext) -> HarnessResult<()> {
	let user = ctx.funded_identity("user").await?;
	let program_id = ctx.program_id()?;
	let (bids, bump) = ctx.pda("initialize", "bids", &HashMap::new())?;

	let submission = ctx
		.with_commitment(TargetCommitment::Finalized)
		.invoke(
			&user,
			"initialize",
			&[
				("user", AccountRef::writable_signer(&user)),
				("bids", AccountRef::writable(bids).created()),
				("systemProgram", AccountRef::readonly(system_program::id())),
			],
			&[],
		)
		.await?;
	if submission.result != ConfirmationResult::Finalized {
		return Err(HarnessError::Internal(format!("initialize ended as {:?}", submission.result)));
	}
	info!(signature = %submission.signature, %bids, "initialize finalized");

	let expected = ExpectedAccount::new()
		.owner(program_id)
		.decoded_as("AllBids")
		.field("totalBids", 0u64)
		.field("bump", bump)
		.field("bidsList", Value::Vec(vec![]))
		.field("admin", user.pubkey());
	ctx.expect_account(&bids, &expected).await?;
	Ok(())
}

/// An `addBid` whose argument payload cannot fit in a transaction.
pub async fn add_bid_oversized_url(ctx: CaseContext) -> HarnessResult<()> {
	let user = ctx.new_identity("user");
	let (bids, _) = ctx.pda("addBid", "bids", &HashMap::new())?;
	let url = "x".repeat(MAX_TRANSACTION_SIZE + 1);

	ctx.invoke(
		&user,
		"addBid",
		&[("user", AccountRef::writable_signer(&user)), ("bids", AccountRef::writable(bids))],
		&[("url", Value::from(url)), ("startingBid", Value::from(1.5f64))],
	)
	.await?;
	Ok(())
}
