//! Check result and status vocabulary.
//!
//! These enumerations are the stable contract surfaced to logging and stats
//! consumers. Their declaration order is load-bearing: callers classify by
//! threshold comparison, not by equality.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal classification of one check run.
///
/// Must remain in this order: success is defined as `result >= Passed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChkResult {
    /// No run has completed yet.
    Unknown,
    /// Valid run but no status information (e.g. agent weight-only reply).
    Neutral,
    /// Check failed.
    Failed,
    /// Check succeeded, server is fully usable.
    Passed,
    /// Check succeeded but the server asked to receive no new sessions.
    CondPass,
}

impl ChkResult {
    /// Whether this result counts as a successful check.
    pub fn is_success(self) -> bool {
        self >= ChkResult::Passed
    }
}

impl fmt::Display for ChkResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChkResult::Unknown => "UNKNOWN",
            ChkResult::Neutral => "NEUTRAL",
            ChkResult::Failed => "FAILED",
            ChkResult::Passed => "PASSED",
            ChkResult::CondPass => "CONDPASS",
        };
        f.write_str(s)
    }
}

/// Detailed status of a check run, layered by protocol depth.
///
/// L4 statuses precede L6, which precede L7. `Checked` and `L57Data` are
/// boundary markers delimiting the "finished" and "has layer 5-7 data"
/// ranges; range predicates rely on their position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    /// Nothing is known about this check yet.
    Unknown,
    /// Check is configured but has not run.
    Init,
    /// A run has started and not finished.
    Start,

    /// Boundary marker: every status past this one is a finished run.
    Checked,

    /// Health analysis detected enough consecutive traffic errors.
    Hana,

    /// Socket-level error.
    SockErr,

    /// L4 check passed (e.g. TCP connect).
    L4Ok,
    /// L4 connect timed out.
    L4Timeout,
    /// L4 connection problem (refused, unreachable, reset).
    L4ConnErr,

    /// L6 check passed (e.g. TLS handshake).
    L6Ok,
    /// L6 (TLS) timeout.
    L6Timeout,
    /// L6 invalid response, protocol error.
    L6Response,

    /// L7 timeout waiting for the application response.
    L7Timeout,
    /// L7 invalid response, protocol error.
    L7Response,

    /// Boundary marker: every status past this one carries L5-7 data.
    L57Data,

    /// L7 check passed.
    L7OkData,
    /// L7 check conditionally passed (server draining).
    L7OkCondData,
    /// L7 response carried a wrong status (e.g. HTTP 5xx).
    L7Status,

    /// External process check failed.
    ProcErr,
    /// External process check timed out.
    ProcTimeout,
    /// External process check passed.
    ProcOk,
}

/// One row of the static status registry.
pub struct StatusEntry {
    /// Result class this status maps to.
    pub result: ChkResult,
    /// Short human readable tag.
    pub info: &'static str,
    /// Long description.
    pub desc: &'static str,
}

impl CheckStatus {
    /// Static registry lookup for this status.
    pub fn entry(self) -> &'static StatusEntry {
        use ChkResult::*;
        macro_rules! entry {
            ($result:expr, $info:expr, $desc:expr) => {
                &StatusEntry { result: $result, info: $info, desc: $desc }
            };
        }
        match self {
            CheckStatus::Unknown => entry!(Unknown, "UNK", "Unknown"),
            CheckStatus::Init => entry!(Unknown, "INI", "Initializing"),
            CheckStatus::Start => entry!(Unknown, "START", "Check started"),
            CheckStatus::Checked => entry!(Unknown, "CHECKED", "No status change"),

            CheckStatus::Hana => {
                entry!(Failed, "HANA", "Health analysis detected enough consecutive errors")
            }

            CheckStatus::SockErr => entry!(Failed, "SOCKERR", "Socket error"),

            CheckStatus::L4Ok => entry!(Passed, "L4OK", "Layer4 check passed"),
            CheckStatus::L4Timeout => entry!(Failed, "L4TOUT", "Layer4 timeout"),
            CheckStatus::L4ConnErr => entry!(Failed, "L4CON", "Layer4 connection problem"),

            CheckStatus::L6Ok => entry!(Passed, "L6OK", "Layer6 check passed"),
            CheckStatus::L6Timeout => entry!(Failed, "L6TOUT", "Layer6 timeout"),
            CheckStatus::L6Response => {
                entry!(Failed, "L6RSP", "Layer6 invalid response - protocol error")
            }

            CheckStatus::L7Timeout => entry!(Failed, "L7TOUT", "Layer7 timeout"),
            CheckStatus::L7Response => {
                entry!(Failed, "L7RSP", "Layer7 invalid response - protocol error")
            }

            CheckStatus::L57Data => entry!(Unknown, "L57DATA", "Layer5-7 data available"),

            CheckStatus::L7OkData => entry!(Passed, "L7OK", "Layer7 check passed"),
            CheckStatus::L7OkCondData => {
                entry!(CondPass, "L7OKC", "Layer7 check conditionally passed")
            }
            CheckStatus::L7Status => entry!(Failed, "L7STS", "Layer7 wrong status"),

            CheckStatus::ProcErr => entry!(Failed, "PROCERR", "External check error"),
            CheckStatus::ProcTimeout => entry!(Failed, "PROCTOUT", "External check timeout"),
            CheckStatus::ProcOk => entry!(Passed, "PROCOK", "External check passed"),
        }
    }

    /// Result class for this status.
    pub fn result(self) -> ChkResult {
        self.entry().result
    }

    /// Whether this status describes a finished run.
    pub fn is_finished(self) -> bool {
        self > CheckStatus::Checked
    }

    /// Whether this status carries layer 5-7 data.
    pub fn has_l57_data(self) -> bool {
        self > CheckStatus::L57Data
    }
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.entry().info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_RESULTS: [ChkResult; 5] = [
        ChkResult::Unknown,
        ChkResult::Neutral,
        ChkResult::Failed,
        ChkResult::Passed,
        ChkResult::CondPass,
    ];

    const ALL_STATUSES: [CheckStatus; 21] = [
        CheckStatus::Unknown,
        CheckStatus::Init,
        CheckStatus::Start,
        CheckStatus::Checked,
        CheckStatus::Hana,
        CheckStatus::SockErr,
        CheckStatus::L4Ok,
        CheckStatus::L4Timeout,
        CheckStatus::L4ConnErr,
        CheckStatus::L6Ok,
        CheckStatus::L6Timeout,
        CheckStatus::L6Response,
        CheckStatus::L7Timeout,
        CheckStatus::L7Response,
        CheckStatus::L57Data,
        CheckStatus::L7OkData,
        CheckStatus::L7OkCondData,
        CheckStatus::L7Status,
        CheckStatus::ProcErr,
        CheckStatus::ProcTimeout,
        CheckStatus::ProcOk,
    ];

    #[test]
    fn test_result_ordering_contract() {
        assert!(ChkResult::Unknown < ChkResult::Neutral);
        assert!(ChkResult::Neutral < ChkResult::Failed);
        assert!(ChkResult::Failed < ChkResult::Passed);
        assert!(ChkResult::Passed < ChkResult::CondPass);
    }

    #[test]
    fn test_success_iff_passed_or_condpass() {
        for result in ALL_RESULTS {
            let expected = matches!(result, ChkResult::Passed | ChkResult::CondPass);
            assert_eq!(result.is_success(), expected, "{result}");
        }
    }

    #[test]
    fn test_layer_ordering_preserved() {
        assert!(CheckStatus::L4Ok < CheckStatus::L6Ok);
        assert!(CheckStatus::L6Ok < CheckStatus::L7Timeout);
        assert!(CheckStatus::L4ConnErr < CheckStatus::L6Response);
        assert!(CheckStatus::L7Response < CheckStatus::L57Data);
    }

    #[test]
    fn test_dummy_markers_delimit_ranges() {
        for status in ALL_STATUSES {
            let finished = !matches!(
                status,
                CheckStatus::Unknown | CheckStatus::Init | CheckStatus::Start | CheckStatus::Checked
            );
            assert_eq!(status.is_finished(), finished, "{status:?}");
        }
        assert!(CheckStatus::L7OkData.has_l57_data());
        assert!(CheckStatus::L7OkCondData.has_l57_data());
        assert!(CheckStatus::L7Status.has_l57_data());
        assert!(!CheckStatus::L7Response.has_l57_data());
        assert!(!CheckStatus::L4Ok.has_l57_data());
    }

    #[test]
    fn test_status_result_classes() {
        assert_eq!(CheckStatus::L4Ok.result(), ChkResult::Passed);
        assert_eq!(CheckStatus::L7OkCondData.result(), ChkResult::CondPass);
        assert_eq!(CheckStatus::L4ConnErr.result(), ChkResult::Failed);
        assert_eq!(CheckStatus::Hana.result(), ChkResult::Failed);
        assert_eq!(CheckStatus::ProcOk.result(), ChkResult::Passed);
        assert_eq!(CheckStatus::Init.result(), ChkResult::Unknown);
    }

    #[test]
    fn test_registry_has_info_for_every_status() {
        for status in ALL_STATUSES {
            assert!(!status.entry().info.is_empty());
            assert!(!status.entry().desc.is_empty());
        }
    }
}
