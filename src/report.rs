use std::time::Duration;

use serde::{Serialize, Serializer};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, HarnessError, HarnessResult};
use crate::orchestrator::CaseStats;
use crate::verifier::FieldDiff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseOutcome {
	Passed,
	/// Failed with the error kind the case declared.
	ExpectedFailure,
	Failed,
}

impl CaseOutcome {
	pub fn is_pass(self) -> bool {
		!matches!(self, CaseOutcome::Failed)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseReport {
	pub name: String,
	pub outcome: CaseOutcome,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error_kind: Option<ErrorKind>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub detail: Option<String>,
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub diff: Vec<FieldDiff>,
	pub duration_ms: u64,
	pub submissions: u32,
	pub retries: u32,
	pub polls: u32,
}

impl CaseReport {
	pub fn new(
		name: &str,
		outcome: CaseOutcome,
		error: Option<&HarnessError>,
		duration: Duration,
		stats: CaseStats,
	) -> Self {
		let diff = match error {
			Some(HarnessError::VerificationFailed(diff)) => diff.clone(),
			_ => Vec::new(),
		};
		Self {
			name: name.to_string(),
			outcome,
			error_kind: error.map(HarnessError::kind),
			detail: error.map(ToString::to_string),
			diff,
			duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
			submissions: stats.submissions,
			retries: stats.retries,
			polls: stats.polls,
		}
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
	pub run_id: Uuid,
	#[serde(serialize_with = "rfc3339")]
	pub started_at: OffsetDateTime,
	#[serde(serialize_with = "rfc3339")]
	pub finished_at: OffsetDateTime,
	pub passed: usize,
	pub failed: usize,
	pub cases: Vec<CaseReport>,
}

fn rfc3339<S: Serializer>(at: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error> {
	let formatted = at.format(&Rfc3339).map_err(serde::ser::Error::custom)?;
	serializer.serialize_str(&formatted)
}

impl Report {
	pub fn start() -> Self {
		let now = OffsetDateTime::now_utc();
		Self { run_id: Uuid::new_v4(), started_at: now, finished_at: now, passed: 0, failed: 0, cases: Vec::new() }
	}

	pub fn finish(&mut self, cases: Vec<CaseReport>) {
		self.finished_at = OffsetDateTime::now_utc();
		self.passed = cases.iter().filter(|c| c.outcome.is_pass()).count();
		self.failed = cases.len() - self.passed;
		self.cases = cases;
	}

	pub fn all_passed(&self) -> bool {
		self.failed == 0
	}

	/// 0 when every case passed, 1 otherwise.
	pub fn exit_code(&self) -> i32 {
		if self.all_passed() {
			0
		} else {
			1
		}
	}

	pub fn case(&self, name: &str) -> Option<&CaseReport> {
		self.cases.iter().find(|c| c.name == name)
	}

	pub fn to_json(&self) -> HarnessResult<String> {
		serde_json::to_string_pretty(self).map_err(|e| HarnessError::Internal(format!("serialize report: {e}")))
	}

	pub fn log_summary(&self) {
		for case in self.cases.iter().filter(|c| !c.outcome.is_pass()) {
			warn!(
				case = %case.name,
				kind = ?case.error_kind,
				detail = case.detail.as_deref().unwrap_or(""),
				"FAILED"
			);
		}
		info!(run_id = %self.run_id, passed = self.passed, failed = self.failed, "test run finished");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn case(name: &str, outcome: CaseOutcome, error: Option<HarnessError>) -> CaseReport {
		CaseReport::new(name, outcome, error.as_ref(), Duration::from_millis(1500), CaseStats::default())
	}

	#[test]
	fn exit_code_follows_failures() {
		let mut report = Report::start();
		report.finish(vec![
			case("ok", CaseOutcome::Passed, None),
			case("expected", CaseOutcome::ExpectedFailure, Some(HarnessError::malformed("too big"))),
		]);
		assert_eq!(report.exit_code(), 0);
		assert_eq!(report.passed, 2);

		report.finish(vec![case("bad", CaseOutcome::Failed, Some(HarnessError::Timeout(Duration::from_secs(5))))]);
		assert_eq!(report.exit_code(), 1);
		assert_eq!(report.failed, 1);
	}

	#[test]
	fn json_carries_kind_and_diff() {
		let diff = vec![FieldDiff { path: "totalBids".into(), expected: "1".into(), actual: "0".into() }];
		let mut report = Report::start();
		report.finish(vec![
			case("ok", CaseOutcome::Passed, None),
			case("state", CaseOutcome::Failed, Some(HarnessError::VerificationFailed(diff))),
		]);
		let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();

		assert_eq!(json["cases"][0]["outcome"], "passed");
		assert!(json["cases"][0].get("error_kind").is_none());
		assert_eq!(json["cases"][1]["error_kind"], "verification_failed");
		assert_eq!(json["cases"][1]["diff"][0]["path"], "totalBids");
		assert_eq!(json["cases"][1]["duration_ms"], 1500);
		assert!(json["started_at"].as_str().unwrap().ends_with('Z'));
	}
}
