use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use dotenvy::dotenv;
use hello_anchor_harness::{
	cluster::SolanaCluster,
	config::HarnessConfig,
	error::{ErrorKind, HarnessError},
	identity::{load_payer, payer_configured},
	idl::ProgramInterface,
	orchestrator::{Harness, Orchestrator},
	suite::hello_anchor_cases,
	telemetry::init_tracing,
};
use tracing::{error, info};

const EXIT_CONFIG_ERROR: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
	// Load environment variables from .env if present
	dotenv().ok();
	init_tracing();

	match run().await {
		Ok(code) => code,
		Err(err) => {
			error!(error = %format!("{err:#}"), "harness aborted");
			let config_error = err.downcast_ref::<HarnessError>().map(HarnessError::kind) == Some(ErrorKind::Config);
			ExitCode::from(if config_error { EXIT_CONFIG_ERROR } else { 1 })
		}
	}
}

async fn run() -> Result<ExitCode> {
	let config = HarnessConfig::from_env()?;

	let mut iface = match &config.idl_path {
		Some(path) => ProgramInterface::from_path(path)?,
		None => ProgramInterface::hello_anchor()?,
	};
	if let Some(program_id) = &config.program_id {
		iface.metadata.address = Some(program_id.clone());
	}
	let program_id = iface.program_id()?;

	let cluster = Arc::new(SolanaCluster::new(&config.endpoint));
	let mut harness = Harness::new(cluster, iface, config.clone());
	if payer_configured(config.payer_keypair_path.as_deref()) {
		let wallet = load_payer(config.payer_keypair_path.as_deref())?;
		info!(wallet = %wallet.pubkey(), "funding test identities from wallet");
		harness = harness.with_wallet(wallet);
	}

	info!(endpoint = %config.endpoint, %program_id, "running hello_anchor suite");
	let report = Orchestrator::new(harness).run(hello_anchor_cases()).await;
	println!("{}", report.to_json()?);
	Ok(ExitCode::from(u8::try_from(report.exit_code()).unwrap_or(1)))
}
