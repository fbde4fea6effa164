use std::fs;
use std::path::{Path, PathBuf};

use gep_evolution::{
    BlastRadius, CapsuleId, EventId, GeneId, MutationId, Outcome, PersonalityMutation,
    SelectorDecision, SourceType,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::EvoKernelError;

pub const SOLIDIFY_STATE_FILE: &str = "evolution_solidify_state.json";

/// Lifecycle of one run. `Pending` blocks the next run until solidified.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", content = "outcome", rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Pending,
    Solidified(Outcome),
}

/// What `start_run` decided before the external patch was applied.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LastRun {
    pub run_id: String,
    pub state: RunState,
    pub created_at: String,
    pub parent_event_id: Option<EventId>,
    pub selected_gene_id: Option<GeneId>,
    pub selected_capsule_id: Option<CapsuleId>,
    pub selector: Option<SelectorDecision>,
    pub signals: Vec<String>,
    /// Kept untyped so that solidify can re-validate the shape.
    pub mutation: Option<Value>,
    pub mutation_id: Option<MutationId>,
    pub personality_state: Option<Value>,
    pub personality_key: Option<String>,
    pub personality_known: bool,
    pub personality_mutations: Vec<PersonalityMutation>,
    pub drift: bool,
    pub selected_by: String,
    pub source_type: SourceType,
    pub reused_asset_id: Option<String>,
    pub reused_source_node: Option<String>,
    pub reused_chain_id: Option<String>,
    pub baseline_untracked: Vec<String>,
    pub baseline_git_head: Option<String>,
    pub blast_radius_estimate: Option<BlastRadius>,
    pub active_task_id: Option<String>,
    pub active_task_title: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LastSolidify {
    pub run_id: String,
    pub at: String,
    pub event_id: EventId,
    #[serde(default)]
    pub capsule_id: Option<CapsuleId>,
    pub outcome: Outcome,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SolidifyState {
    pub last_run: Option<LastRun>,
    pub last_solidify: Option<LastSolidify>,
}

impl SolidifyState {
    /// The latest run and its state. A run still marked pending whose id
    /// matches `last_solidify` counts as solidified.
    pub fn run_state(&self) -> Option<(&str, RunState)> {
        let run = self
            .last_run
            .as_ref()
            .filter(|run| !run.run_id.is_empty())?;
        let state = match (run.state, &self.last_solidify) {
            (RunState::Pending, Some(done)) if done.run_id == run.run_id => {
                RunState::Solidified(done.outcome)
            }
            (state, _) => state,
        };
        Some((run.run_id.as_str(), state))
    }

    /// Refuses to begin a new run while the previous one is pending.
    pub fn ensure_not_pending(&self) -> Result<(), EvoKernelError> {
        match self.run_state() {
            Some((run_id, RunState::Pending)) => Err(EvoKernelError::PendingRun(run_id.to_string())),
            _ => Ok(()),
        }
    }

    /// Refuses to solidify a run twice.
    pub fn ensure_solidifiable(&self) -> Result<(), EvoKernelError> {
        match self.run_state() {
            Some((run_id, RunState::Solidified(_))) => {
                Err(EvoKernelError::AlreadySolidified(run_id.to_string()))
            }
            _ => Ok(()),
        }
    }

    pub fn mark_solidified(&mut self, record: LastSolidify) {
        if let Some(run) = self
            .last_run
            .as_mut()
            .filter(|run| run.run_id == record.run_id)
        {
            run.state = RunState::Solidified(record.outcome);
        }
        self.last_solidify = Some(record);
    }
}

pub struct SolidifyStateFile {
    path: PathBuf,
}

impl SolidifyStateFile {
    pub fn new<P: Into<PathBuf>>(evolution_dir: P) -> Self {
        Self {
            path: evolution_dir.into().join(SOLIDIFY_STATE_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing, empty, or corrupt files read as the empty state.
    pub fn read(&self) -> SolidifyState {
        fs::read_to_string(&self.path)
            .ok()
            .filter(|raw| !raw.trim().is_empty())
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn write(&self, state: &SolidifyState) -> Result<(), EvoKernelError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(state_err)?;
        }
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let mut bytes = serde_json::to_vec_pretty(state)
            .map_err(|err| EvoKernelError::State(err.to_string()))?;
        bytes.push(b'\n');
        fs::write(&tmp, bytes).map_err(state_err)?;
        fs::rename(&tmp, &self.path).map_err(state_err)
    }
}

fn state_err(err: std::io::Error) -> EvoKernelError {
    EvoKernelError::State(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gep_evolution::{next_id, OutcomeStatus};
    use serde_json::json;

    fn temp_root(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("gep-evokernel-{name}-{}", next_id("t")))
    }

    fn run(run_id: &str) -> LastRun {
        LastRun {
            run_id: run_id.into(),
            ..LastRun::default()
        }
    }

    fn solidified(run_id: &str) -> LastSolidify {
        LastSolidify {
            run_id: run_id.into(),
            at: "2026-01-01T00:00:00.000Z".into(),
            event_id: "evt_1".into(),
            capsule_id: None,
            outcome: Outcome {
                status: OutcomeStatus::Failed,
                score: 0.2,
            },
        }
    }

    #[test]
    fn empty_state_never_blocks() {
        let state = SolidifyState::default();
        assert!(state.run_state().is_none());
        assert!(state.ensure_not_pending().is_ok());
        assert!(state.ensure_solidifiable().is_ok());
    }

    #[test]
    fn pending_run_blocks_until_marked_solidified() {
        let mut state = SolidifyState {
            last_run: Some(run("run_1")),
            last_solidify: Some(solidified("run_0")),
        };
        let err = state.ensure_not_pending().unwrap_err();
        assert!(matches!(err, EvoKernelError::PendingRun(ref id) if id == "run_1"));

        state.mark_solidified(solidified("run_1"));
        assert!(state.ensure_not_pending().is_ok());
        assert!(matches!(
            state.run_state(),
            Some(("run_1", RunState::Solidified(outcome))) if outcome.status == OutcomeStatus::Failed
        ));
        assert!(matches!(
            state.ensure_solidifiable(),
            Err(EvoKernelError::AlreadySolidified(_))
        ));
    }

    #[test]
    fn legacy_files_without_state_are_reconciled_by_run_id() {
        let state: SolidifyState = serde_json::from_value(json!({
            "last_run": {"run_id": "run_7", "signals": ["log_error"]},
            "last_solidify": {
                "run_id": "run_7",
                "at": "2026-01-01T00:00:00.000Z",
                "event_id": "evt_7",
                "outcome": {"status": "success", "score": 0.85}
            }
        }))
        .unwrap();
        assert!(state.ensure_not_pending().is_ok());
        assert_eq!(state.last_run.as_ref().unwrap().state, RunState::Pending);
    }

    #[test]
    fn state_tag_is_persisted_next_to_the_run_id() {
        let mut state = SolidifyState {
            last_run: Some(run("run_2")),
            last_solidify: None,
        };
        state.mark_solidified(LastSolidify {
            outcome: Outcome {
                status: OutcomeStatus::Success,
                score: 0.85,
            },
            ..solidified("run_2")
        });
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["last_run"]["run_id"], "run_2");
        assert_eq!(value["last_run"]["state"]["status"], "solidified");
        assert_eq!(value["last_run"]["state"]["outcome"]["status"], "success");

        let pending = serde_json::to_value(RunState::Pending).unwrap();
        assert_eq!(pending, json!({"status": "pending"}));
    }

    #[test]
    fn file_round_trip_and_corruption_fallback() {
        let root = temp_root("state-file");
        let file = SolidifyStateFile::new(&root);
        assert_eq!(file.read(), SolidifyState::default());

        let state = SolidifyState {
            last_run: Some(run("run_3")),
            last_solidify: None,
        };
        file.write(&state).unwrap();
        assert_eq!(file.read(), state);
        assert!(!root.join(format!("{SOLIDIFY_STATE_FILE}.tmp")).exists());

        fs::write(file.path(), "{not json").unwrap();
        assert_eq!(file.read(), SolidifyState::default());
    }
}
