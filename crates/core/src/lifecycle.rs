use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 流水线阶段
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Request,
    Planning,
    Coding,
    Validating,
    Integrating,
    Versioning,
    Disabling,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Request => "request",
            Stage::Planning => "planning",
            Stage::Coding => "coding",
            Stage::Validating => "validating",
            Stage::Integrating => "integrating",
            Stage::Versioning => "versioning",
            Stage::Disabling => "disabling",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "request" => Some(Stage::Request),
            "planning" => Some(Stage::Planning),
            "coding" => Some(Stage::Coding),
            "validating" => Some(Stage::Validating),
            "integrating" => Some(Stage::Integrating),
            "versioning" => Some(Stage::Versioning),
            "disabling" => Some(Stage::Disabling),
            _ => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
    InProgress,
    Cancelled,
    RolledBack,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
            Outcome::InProgress => "in_progress",
            Outcome::Cancelled => "cancelled",
            Outcome::RolledBack => "rolled_back",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Outcome::Success),
            "failure" => Some(Outcome::Failure),
            "in_progress" => Some(Outcome::InProgress),
            "cancelled" => Some(Outcome::Cancelled),
            "rolled_back" => Some(Outcome::RolledBack),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One line of the transaction log. Never mutated once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TmsEntry {
    pub sequence_id: u64,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub capability_name: String,
    pub stage: Stage,
    pub outcome: Outcome,
    pub detail: String,
    pub agent_version: String,
}

impl TmsEntry {
    /// An entry awaiting its sequence id; the log assigns it on append.
    pub fn new(
        request_id: &str,
        capability_name: &str,
        stage: Stage,
        outcome: Outcome,
        detail: impl Into<String>,
        agent_version: &str,
    ) -> Self {
        Self {
            sequence_id: 0,
            timestamp: Utc::now(),
            request_id: request_id.to_string(),
            capability_name: capability_name.to_string(),
            stage,
            outcome,
            detail: detail.into(),
            agent_version: agent_version.to_string(),
        }
    }
}

/// Lifecycle state of a capability as derived from its log entries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum LifecycleState {
    Requested,
    Planning,
    Planned,
    Coding,
    Coded,
    Validating,
    Validated,
    Integrating,
    Integrated,
    Disabled,
    Failed(Stage),
    RolledBack,
    Cancelled,
    Rejected,
}

impl LifecycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleState::Planned
                | LifecycleState::Integrated
                | LifecycleState::Disabled
                | LifecycleState::Failed(_)
                | LifecycleState::RolledBack
                | LifecycleState::Cancelled
                | LifecycleState::Rejected
        )
    }

    /// 进入 INTEGRATING 之后不可取消
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            LifecycleState::Requested
                | LifecycleState::Planning
                | LifecycleState::Planned
                | LifecycleState::Coding
                | LifecycleState::Coded
                | LifecycleState::Validating
                | LifecycleState::Validated
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Requested => write!(f, "REQUESTED"),
            LifecycleState::Planning => write!(f, "PLANNING"),
            LifecycleState::Planned => write!(f, "PLANNED"),
            LifecycleState::Coding => write!(f, "CODING"),
            LifecycleState::Coded => write!(f, "CODED"),
            LifecycleState::Validating => write!(f, "VALIDATING"),
            LifecycleState::Validated => write!(f, "VALIDATED"),
            LifecycleState::Integrating => write!(f, "INTEGRATING"),
            LifecycleState::Integrated => write!(f, "INTEGRATED"),
            LifecycleState::Disabled => write!(f, "DISABLED"),
            LifecycleState::Failed(stage) => write!(f, "FAILED({})", stage),
            LifecycleState::RolledBack => write!(f, "ROLLED_BACK"),
            LifecycleState::Cancelled => write!(f, "CANCELLED"),
            LifecycleState::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// Result of replaying one capability's entries.
#[derive(Debug, Clone, PartialEq)]
pub struct Replay {
    pub state: LifecycleState,
    /// Request id of the workflow that produced `state`.
    pub request_id: String,
    pub last_sequence_id: u64,
    /// A versioning success entry exists for the integrating request.
    pub versioned: bool,
}

impl Replay {
    /// Fold entries (in sequence order) into the last durable lifecycle state.
    ///
    /// A rejected request never disturbs the state of an earlier workflow;
    /// it only shows up when nothing else was ever logged for the name.
    pub fn from_entries(entries: &[TmsEntry]) -> Option<Replay> {
        let mut replay: Option<Replay> = None;

        for entry in entries {
            if entry.stage == Stage::Request && entry.outcome == Outcome::Failure {
                if replay.is_none() {
                    replay = Some(Replay {
                        state: LifecycleState::Rejected,
                        request_id: entry.request_id.clone(),
                        last_sequence_id: entry.sequence_id,
                        versioned: false,
                    });
                }
                continue;
            }

            let current = replay.as_ref().map(|r| r.state);
            let next = match (entry.stage, entry.outcome) {
                (_, Outcome::Cancelled) => LifecycleState::Cancelled,
                (_, Outcome::RolledBack) => LifecycleState::RolledBack,
                (Stage::Request, _) => LifecycleState::Requested,
                (Stage::Planning, Outcome::InProgress) => LifecycleState::Planning,
                (Stage::Planning, Outcome::Success) => LifecycleState::Planned,
                (Stage::Coding, Outcome::InProgress) => LifecycleState::Coding,
                (Stage::Coding, Outcome::Success) => LifecycleState::Coded,
                (Stage::Validating, Outcome::InProgress) => LifecycleState::Validating,
                (Stage::Validating, Outcome::Success) => LifecycleState::Validated,
                (Stage::Integrating, Outcome::InProgress) => LifecycleState::Integrating,
                (Stage::Integrating, Outcome::Success) => LifecycleState::Integrated,
                (Stage::Versioning, _) => current.unwrap_or(LifecycleState::Integrated),
                (Stage::Disabling, Outcome::Success) => LifecycleState::Disabled,
                (Stage::Disabling, _) => current.unwrap_or(LifecycleState::Integrated),
                (stage, Outcome::Failure) => LifecycleState::Failed(stage),
            };

            let versioned = match (entry.stage, entry.outcome) {
                (Stage::Versioning, Outcome::Success) => true,
                (Stage::Versioning, _) | (Stage::Disabling, _) => {
                    replay.as_ref().map(|r| r.versioned).unwrap_or(false)
                }
                _ => false,
            };

            // 版本/禁用条目沿用原工作流的 request_id
            let request_id = match entry.stage {
                Stage::Versioning | Stage::Disabling => replay
                    .as_ref()
                    .map(|r| r.request_id.clone())
                    .unwrap_or_else(|| entry.request_id.clone()),
                _ => entry.request_id.clone(),
            };

            replay = Some(Replay {
                state: next,
                request_id,
                last_sequence_id: entry.sequence_id,
                versioned,
            });
        }

        replay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(seq: u64, req: &str, stage: Stage, outcome: Outcome) -> TmsEntry {
        let mut e = TmsEntry::new(req, "greet", stage, outcome, "", "0.1.0");
        e.sequence_id = seq;
        e
    }

    #[test]
    fn test_replay_planned() {
        let entries = vec![
            entry(1, "r1", Stage::Request, Outcome::InProgress),
            entry(2, "r1", Stage::Planning, Outcome::InProgress),
            entry(3, "r1", Stage::Planning, Outcome::Success),
        ];
        let replay = Replay::from_entries(&entries).unwrap();
        assert_eq!(replay.state, LifecycleState::Planned);
        assert_eq!(replay.request_id, "r1");
        assert_eq!(replay.last_sequence_id, 3);
        assert!(replay.state.is_terminal());
    }

    #[test]
    fn test_replay_failure_and_retry_round() {
        let entries = vec![
            entry(1, "r1", Stage::Request, Outcome::InProgress),
            entry(2, "r1", Stage::Coding, Outcome::Success),
            entry(3, "r1", Stage::Validating, Outcome::Failure),
            entry(4, "r1", Stage::Coding, Outcome::InProgress),
        ];
        assert_eq!(Replay::from_entries(&entries).unwrap().state, LifecycleState::Coding);

        let failed = vec![
            entry(1, "r1", Stage::Request, Outcome::InProgress),
            entry(2, "r1", Stage::Planning, Outcome::Failure),
        ];
        assert_eq!(
            Replay::from_entries(&failed).unwrap().state,
            LifecycleState::Failed(Stage::Planning)
        );
    }

    #[test]
    fn test_rejected_request_does_not_override_state() {
        let entries = vec![
            entry(1, "r1", Stage::Request, Outcome::InProgress),
            entry(2, "r1", Stage::Integrating, Outcome::Success),
            entry(3, "r1", Stage::Versioning, Outcome::Success),
            entry(4, "r2", Stage::Request, Outcome::Failure),
        ];
        let replay = Replay::from_entries(&entries).unwrap();
        assert_eq!(replay.state, LifecycleState::Integrated);
        assert!(replay.versioned);
        assert_eq!(replay.request_id, "r1");

        let only_rejected = vec![entry(1, "r9", Stage::Request, Outcome::Failure)];
        assert_eq!(
            Replay::from_entries(&only_rejected).unwrap().state,
            LifecycleState::Rejected
        );
    }

    #[test]
    fn test_integrated_without_versioning() {
        let entries = vec![
            entry(1, "r1", Stage::Integrating, Outcome::InProgress),
            entry(2, "r1", Stage::Integrating, Outcome::Success),
        ];
        let replay = Replay::from_entries(&entries).unwrap();
        assert_eq!(replay.state, LifecycleState::Integrated);
        assert!(!replay.versioned);
    }

    #[test]
    fn test_disable_and_rollback() {
        let entries = vec![
            entry(1, "r1", Stage::Integrating, Outcome::Success),
            entry(2, "r1", Stage::Versioning, Outcome::Success),
            entry(3, "d1", Stage::Disabling, Outcome::InProgress),
            entry(4, "d1", Stage::Disabling, Outcome::Success),
        ];
        let replay = Replay::from_entries(&entries).unwrap();
        assert_eq!(replay.state, LifecycleState::Disabled);
        assert_eq!(replay.request_id, "r1");

        let rolled = vec![
            entry(1, "r1", Stage::Integrating, Outcome::InProgress),
            entry(2, "r1", Stage::Integrating, Outcome::Failure),
            entry(3, "r1", Stage::Integrating, Outcome::RolledBack),
        ];
        assert_eq!(Replay::from_entries(&rolled).unwrap().state, LifecycleState::RolledBack);
        assert_eq!(LifecycleState::Failed(Stage::Planning).to_string(), "FAILED(planning)");
    }

    #[test]
    fn test_cancellable_states() {
        assert!(LifecycleState::Planning.is_cancellable());
        assert!(!LifecycleState::Integrating.is_cancellable());
        assert!(!LifecycleState::Integrated.is_cancellable());
    }
}
