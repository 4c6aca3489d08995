// JSON-RPC adapter against a scripted HTTP endpoint

#[cfg(test)]
mod tests {
    use hello_anchor_harness::{
        builder::{build, AccountRef, ValidityMarker},
        cluster::{ClusterRpc, SignatureStatus, SolanaCluster},
        error::{HarnessError, TerminalReason},
        identity::IdentityGenerator,
    };
    use serde_json::{json, Value};
    use solana_sdk::{hash::Hash, pubkey::Pubkey};
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rpc_result(result: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({ "jsonrpc": "2.0", "id": 1, "result": result }))
    }

    fn rpc_error(code: i64, message: &str, data: Option<Value>) -> ResponseTemplate {
        let mut error = json!({ "code": code, "message": message });
        if let Some(data) = data {
            error["data"] = data;
        }
        ResponseTemplate::new(200).set_body_json(json!({ "jsonrpc": "2.0", "id": 1, "error": error }))
    }

    async fn respond(server: &MockServer, rpc_method: &str, response: ResponseTemplate) {
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": rpc_method })))
            .respond_with(response)
            .mount(server)
            .await;
    }

    /// The client asks for the node version before commitment-bearing calls.
    async fn node() -> (MockServer, SolanaCluster) {
        let server = MockServer::start().await;
        respond(&server, "getVersion", rpc_result(json!({ "solana-core": "1.18.26", "feature-set": 1 }))).await;
        let cluster = SolanaCluster::new(&server.uri());
        (server, cluster)
    }

    #[tokio::test]
    async fn test_latest_validity_marker() {
        let (server, cluster) = node().await;
        let blockhash = Hash::new_unique();
        respond(
            &server,
            "getLatestBlockhash",
            rpc_result(json!({
                "context": { "slot": 10 },
                "value": { "blockhash": blockhash.to_string(), "lastValidBlockHeight": 310 }
            })),
        )
        .await;

        let marker = cluster.latest_validity_marker().await.unwrap();
        assert_eq!(marker, ValidityMarker { blockhash, last_valid_block_height: 310 });
    }

    #[tokio::test]
    async fn test_signature_status_mapping() {
        let (server, cluster) = node().await;
        respond(
            &server,
            "getSignatureStatuses",
            rpc_result(json!({
                "context": { "slot": 12 },
                "value": [{
                    "slot": 11,
                    "confirmations": null,
                    "status": { "Ok": null },
                    "err": null,
                    "confirmationStatus": "finalized"
                }]
            })),
        )
        .await;

        let status = cluster.signature_status(&Default::default()).await.unwrap();
        assert_eq!(status, SignatureStatus::Finalized);
    }

    #[tokio::test]
    async fn test_failed_signature_keeps_program_error_code() {
        let (server, cluster) = node().await;
        let err = json!({ "InstructionError": [0, { "Custom": 6001 }] });
        respond(
            &server,
            "getSignatureStatuses",
            rpc_result(json!({
                "context": { "slot": 12 },
                "value": [{
                    "slot": 11,
                    "confirmations": 0,
                    "status": { "Err": err },
                    "err": err,
                    "confirmationStatus": "confirmed"
                }]
            })),
        )
        .await;

        let status = cluster.signature_status(&Default::default()).await.unwrap();
        assert_eq!(status, SignatureStatus::Failed(TerminalReason::ProgramError { instruction: 0, code: 6001 }));
    }

    #[tokio::test]
    async fn test_unknown_signature() {
        let (server, cluster) = node().await;
        respond(&server, "getSignatureStatuses", rpc_result(json!({ "context": { "slot": 1 }, "value": [null] }))).await;

        assert_eq!(cluster.signature_status(&Default::default()).await.unwrap(), SignatureStatus::Unknown);
    }

    #[tokio::test]
    async fn test_unhealthy_node_is_transient() {
        let (server, cluster) = node().await;
        respond(&server, "getSignatureStatuses", rpc_error(-32005, "Node is unhealthy", None)).await;

        let err = cluster.signature_status(&Default::default()).await.unwrap_err();
        assert!(err.is_retryable(), "got {err:?}");
    }

    #[tokio::test]
    async fn test_overloaded_http_node_is_transient() {
        let (server, cluster) = node().await;
        respond(&server, "getSignatureStatuses", ResponseTemplate::new(503)).await;

        let err = cluster.signature_status(&Default::default()).await.unwrap_err();
        assert!(err.is_retryable(), "got {err:?}");
    }

    #[tokio::test]
    async fn test_undecodable_response_is_terminal() {
        let (server, cluster) = node().await;
        respond(
            &server,
            "getSignatureStatuses",
            ResponseTemplate::new(200).set_body_raw("<html>gateway</html>", "text/html"),
        )
        .await;

        let err = cluster.signature_status(&Default::default()).await.unwrap_err();
        assert!(!err.is_retryable(), "got {err:?}");
    }

    #[tokio::test]
    async fn test_block_height() {
        let (server, cluster) = node().await;
        respond(&server, "getBlockHeight", rpc_result(json!(1_234))).await;

        assert_eq!(cluster.block_height().await.unwrap(), 1_234);
    }

    #[tokio::test]
    async fn test_account_decoding() {
        use base64::Engine;

        let (server, cluster) = node().await;
        let owner = Pubkey::new_unique();
        let data = base64::engine::general_purpose::STANDARD.encode([1u8, 2, 3, 4]);
        respond(
            &server,
            "getAccountInfo",
            rpc_result(json!({
                "context": { "slot": 5 },
                "value": {
                    "data": [data, "base64"],
                    "executable": false,
                    "lamports": 1_000,
                    "owner": owner.to_string(),
                    "rentEpoch": 0,
                    "space": 4
                }
            })),
        )
        .await;

        let account = cluster.account(&Pubkey::new_unique()).await.unwrap().unwrap();
        assert_eq!(account.owner, owner);
        assert_eq!(account.lamports, 1_000);
        assert_eq!(account.data, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_missing_account_is_none() {
        let (server, cluster) = node().await;
        respond(&server, "getAccountInfo", rpc_result(json!({ "context": { "slot": 5 }, "value": null }))).await;

        assert!(cluster.account(&Pubkey::new_unique()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_transaction_and_preflight_rejection() {
        let payer = IdentityGenerator::new().new_identity();
        let marker = ValidityMarker { blockhash: Hash::new_unique(), last_valid_block_height: 100 };
        let tx = build(Pubkey::new_unique(), vec![AccountRef::writable_signer(&payer)], vec![], &payer, marker)
            .unwrap();

        let (server, cluster) = node().await;
        respond(&server, "sendTransaction", rpc_result(json!(tx.signature().to_string()))).await;
        assert_eq!(cluster.send_transaction(&tx.transaction).await.unwrap(), tx.signature());

        let (server, cluster) = node().await;
        respond(
            &server,
            "sendTransaction",
            rpc_error(
                -32002,
                "Transaction simulation failed: Blockhash not found",
                Some(json!({
                    "err": "BlockhashNotFound",
                    "logs": [],
                    "accounts": null,
                    "unitsConsumed": 0,
                    "returnData": null
                })),
            ),
        )
        .await;
        let err = cluster.send_transaction(&tx.transaction).await.unwrap_err();
        assert_eq!(err, HarnessError::TerminalSubmission(TerminalReason::ValidityMarkerExpired));
    }
}
