// Interface-driven transaction building

mod test_utils;

#[cfg(test)]
mod tests {
    use crate::test_utils::*;
    use hello_anchor_harness::{
        builder::{AccountRef, Invocation, TransactionBuilder},
        codec::Value,
        error::HarnessError,
        idl::instruction_discriminator,
    };
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_add_bid_arguments_are_borsh_encoded() {
        let ctx = TestContext::new();
        let user = ctx.generator.new_identity();
        let (bids, _) = ctx.bids_address();

        let invocation = assert_ok!(Invocation::from_interface(
            &ctx.iface,
            "addBid",
            &[("user", AccountRef::writable_signer(&user)), ("bids", AccountRef::writable(bids))],
            &[("url", Value::from("https://x.io")), ("startingBid", Value::from(2.5f64))],
        ));

        let mut expected = instruction_discriminator("add_bid").to_vec();
        expected.extend_from_slice(&12u32.to_le_bytes());
        expected.extend_from_slice(b"https://x.io");
        expected.extend_from_slice(&2.5f64.to_le_bytes());
        assert_eq!(invocation.data, expected);
        assert_eq!(invocation.program_id, ctx.program_id);
        assert_eq!(invocation.name.as_deref(), Some("addBid"));
    }

    #[test]
    fn test_missing_argument_is_malformed() {
        let ctx = TestContext::new();
        let user = ctx.generator.new_identity();
        let (bids, _) = ctx.bids_address();

        let err = assert_err!(Invocation::from_interface(
            &ctx.iface,
            "addBid",
            &[("user", AccountRef::writable_signer(&user)), ("bids", AccountRef::writable(bids))],
            &[("url", Value::from("https://x.io"))],
        ));
        assert!(matches!(err, HarnessError::MalformedInstruction(_)), "got {err:?}");
    }

    #[test]
    fn test_same_inputs_build_the_same_transaction() {
        let ctx = TestContext::new();
        let payer = ctx.generator.new_identity();
        let marker = unsent_marker();
        let invocation = Invocation::new(ctx.noop_program, vec![AccountRef::writable_signer(&payer)], vec![9; 16]);

        let first = assert_ok!(TransactionBuilder::new(&payer).invoke(invocation.clone()).build(marker));
        let second = assert_ok!(TransactionBuilder::new(&payer).invoke(invocation).build(marker));
        assert_eq!(first.transaction, second.transaction);
        assert_eq!(first.signature(), second.signature());
    }

    #[test]
    fn test_fresh_marker_changes_the_signature() {
        let ctx = TestContext::new();
        let payer = ctx.generator.new_identity();
        let invocation = Invocation::new(ctx.noop_program, vec![AccountRef::writable_signer(&payer)], vec![]);

        let first = assert_ok!(TransactionBuilder::new(&payer).invoke(invocation.clone()).build(unsent_marker()));
        let second = assert_ok!(TransactionBuilder::new(&payer).invoke(invocation).build(unsent_marker()));
        assert_ne!(first.signature(), second.signature());
    }

    #[test]
    fn test_transaction_without_instructions_is_malformed() {
        let payer = TestContext::new().generator.new_identity();
        let err = assert_err!(TransactionBuilder::new(&payer).build(unsent_marker()));
        assert!(matches!(err, HarnessError::MalformedInstruction(_)));
    }
}
