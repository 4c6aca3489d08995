pub mod builder;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod idl;
pub mod orchestrator;
pub mod report;
pub mod suite;
pub mod telemetry;
pub mod verifier;
