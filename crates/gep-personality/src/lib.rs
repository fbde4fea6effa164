//! Persisted personality model: the current behavioral bias vector, outcome
//! statistics per quantized configuration, and bounded history.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use gep_evolution::{
    clamp01, clip, AssetKind, EvolutionEvent, OutcomeStatus, PersonalityMutation,
    PersonalityParam, PersonalityState,
};
use gep_mutation::has_opportunity_signal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const MIN_SAMPLES_FOR_BEST: u64 = 3;
const MAX_MUTATIONS_PER_STEP: usize = 2;
const MUTATION_CLIP: f64 = 0.2;
const NATURAL_SELECTION_CLIP: f64 = 0.1;
const NATURAL_SELECTION_MIN_DELTA: f64 = 0.05;

#[derive(Debug, Error)]
pub enum PersonalityError {
    #[error("personality I/O error: {0}")]
    Io(String),
    #[error("personality serialization error: {0}")]
    Serde(String),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PersonalityConfig {
    pub history_limit: usize,
}

impl Default for PersonalityConfig {
    fn default() -> Self {
        Self { history_limit: 120 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PersonalityStats {
    #[serde(default)]
    pub success: u64,
    #[serde(default)]
    pub fail: u64,
    #[serde(default = "neutral_score")]
    pub avg_score: f64,
    #[serde(default)]
    pub n: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Default for PersonalityStats {
    fn default() -> Self {
        Self {
            success: 0,
            fail: 0,
            avg_score: neutral_score(),
            n: 0,
            updated_at: None,
        }
    }
}

impl PersonalityStats {
    pub fn total(&self) -> u64 {
        self.success + self.fail
    }

    /// Laplace success rate blended with the average score, the latter
    /// weighted by sample size up to eight outcomes.
    pub fn score(&self) -> f64 {
        let total = self.total() as f64;
        let p = (self.success as f64 + 1.0) / (total + 2.0);
        let sample_weight = (total / 8.0).min(1.0);
        let q = if self.avg_score.is_finite() {
            clamp01(self.avg_score)
        } else {
            neutral_score()
        };
        p * 0.75 + q * 0.25 * sample_weight
    }
}

fn neutral_score() -> f64 {
    0.5
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub at: String,
    pub key: String,
    pub outcome: String,
    pub score: Option<f64>,
    pub notes: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PersonalityModel {
    #[serde(default = "model_version")]
    pub version: u32,
    #[serde(default)]
    pub current: PersonalityState,
    #[serde(default)]
    pub stats: BTreeMap<String, PersonalityStats>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub updated_at: String,
}

fn model_version() -> u32 {
    1
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BestKnown {
    pub key: String,
    pub score: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MutationTrigger {
    pub reason: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelMeta {
    pub best_known_key: Option<String>,
    pub best_known_score: Option<f64>,
    pub triggered: Option<MutationTrigger>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PersonalitySelection {
    pub state: PersonalityState,
    pub key: String,
    pub known: bool,
    pub mutations: Vec<PersonalityMutation>,
    pub meta: ModelMeta,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AppliedMutations {
    pub state: PersonalityState,
    pub applied: Vec<PersonalityMutation>,
}

/// Shape check for a personality state read back from untyped state.
pub fn is_valid_personality_state(value: &Value) -> bool {
    if value.get("type").and_then(Value::as_str) != Some("PersonalityState") {
        return false;
    }
    PersonalityParam::ALL.iter().all(|param| {
        value
            .get(param.as_str())
            .and_then(number_like)
            .map_or(false, |number| (0.0..=1.0).contains(&number))
    })
}

fn number_like(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

/// Parses `rigor=0.7|creativity=0.3|...`; unknown or missing parameters keep defaults.
pub fn parse_key_to_state(key: &str) -> PersonalityState {
    let mut state = PersonalityState::default();
    for part in key.split('|').map(str::trim).filter(|part| !part.is_empty()) {
        let mut pieces = part.splitn(2, '=');
        let name = pieces.next().unwrap_or_default().trim();
        let Some(param) = PersonalityParam::parse(name) else {
            continue;
        };
        let value = pieces
            .next()
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .unwrap_or(f64::NAN);
        state.set(param, clamp01(value));
    }
    state.normalized()
}

/// Per-parameter differences, largest magnitude first.
pub fn param_deltas(from: &PersonalityState, to: &PersonalityState) -> Vec<(PersonalityParam, f64)> {
    let from = from.normalized();
    let to = to.normalized();
    let mut deltas = PersonalityParam::ALL
        .iter()
        .map(|param| (*param, to.get(*param) - from.get(*param)))
        .collect::<Vec<_>>();
    deltas.sort_by(|left, right| {
        right
            .1
            .abs()
            .partial_cmp(&left.1.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    deltas
}

pub fn choose_best_known(stats: &BTreeMap<String, PersonalityStats>) -> Option<BestKnown> {
    let mut best: Option<BestKnown> = None;
    for (key, entry) in stats {
        if entry.total() < MIN_SAMPLES_FOR_BEST {
            continue;
        }
        let score = entry.score();
        if best.as_ref().map_or(true, |current| score > current.score) {
            best = Some(BestKnown {
                key: key.clone(),
                score,
            });
        }
    }
    best
}

/// Applies at most two mutations, each clipped to ±0.2.
pub fn apply_personality_mutations(
    state: &PersonalityState,
    mutations: &[PersonalityMutation],
) -> AppliedMutations {
    let mut current = state.normalized();
    let mut applied = Vec::new();
    for mutation in mutations {
        if !mutation.delta.is_finite() {
            continue;
        }
        let clipped = mutation.delta.clamp(-MUTATION_CLIP, MUTATION_CLIP);
        current.set(mutation.param, clamp01(current.get(mutation.param) + clipped));
        applied.push(personality_mutation(
            mutation.param,
            clipped,
            &clip(&mutation.reason, 140),
        ));
        if applied.len() >= MAX_MUTATIONS_PER_STEP {
            break;
        }
    }
    AppliedMutations {
        state: current,
        applied,
    }
}

pub fn propose_mutations<S: AsRef<str>>(
    base: &PersonalityState,
    reason: &str,
    drift_enabled: bool,
    signals: &[S],
) -> Vec<PersonalityMutation> {
    let base = base.normalized();
    let first_reason = |fallback: &str| {
        if reason.is_empty() {
            fallback.to_string()
        } else {
            reason.to_string()
        }
    };
    let has = |wanted: &str| signals.iter().any(|signal| signal.as_ref() == wanted);
    let errorish = has("log_error")
        || signals.iter().any(|signal| {
            let signal = signal.as_ref();
            signal.starts_with("errsig:") || signal.starts_with("errsig_norm:")
        });

    let mut mutations = if drift_enabled {
        vec![
            personality_mutation(
                PersonalityParam::Creativity,
                0.1,
                &first_reason("drift enabled"),
            ),
            personality_mutation(PersonalityParam::RiskTolerance, -0.05, "drift safety clamp"),
        ]
    } else if has("protocol_drift") {
        vec![
            personality_mutation(
                PersonalityParam::Obedience,
                0.1,
                &first_reason("protocol drift"),
            ),
            personality_mutation(PersonalityParam::Rigor, 0.05, "tighten protocol compliance"),
        ]
    } else if errorish {
        vec![
            personality_mutation(
                PersonalityParam::Rigor,
                0.1,
                &first_reason("repair instability"),
            ),
            personality_mutation(
                PersonalityParam::RiskTolerance,
                -0.1,
                "reduce risky changes under errors",
            ),
        ]
    } else if has_opportunity_signal(signals) {
        vec![
            personality_mutation(
                PersonalityParam::Creativity,
                0.1,
                &first_reason("opportunity signal detected"),
            ),
            personality_mutation(
                PersonalityParam::RiskTolerance,
                0.05,
                "allow exploration for innovation",
            ),
        ]
    } else {
        vec![
            personality_mutation(PersonalityParam::Rigor, 0.05, &first_reason("stability bias")),
            personality_mutation(PersonalityParam::Verbosity, -0.05, "reduce noise"),
        ]
    };

    if base.obedience >= 0.95 {
        if let Some(slot) = mutations
            .iter_mut()
            .find(|mutation| mutation.param == PersonalityParam::Obedience)
        {
            *slot = personality_mutation(PersonalityParam::Creativity, 0.05, "obedience saturated");
        }
    }
    mutations
}

/// Drift, three failures in the last four outcomes, or three failed
/// mutation-bearing events in a row, all within the last six events.
pub fn should_trigger_mutation(
    drift_enabled: bool,
    recent_events: &[EvolutionEvent],
) -> Option<MutationTrigger> {
    if drift_enabled {
        return Some(MutationTrigger {
            reason: "drift enabled".to_string(),
        });
    }
    let tail = &recent_events[recent_events.len().saturating_sub(6)..];
    if tail.len() >= 4 {
        let failed = tail[tail.len() - 4..]
            .iter()
            .filter(|event| event.outcome.status == OutcomeStatus::Failed)
            .count();
        if failed >= 3 {
            return Some(MutationTrigger {
                reason: "long failure streak".to_string(),
            });
        }
    }
    let with_mutation = tail
        .iter()
        .filter(|event| {
            event
                .mutation_id
                .as_deref()
                .map_or(false, |id| !id.is_empty())
        })
        .collect::<Vec<_>>();
    if with_mutation.len() >= 3
        && with_mutation[with_mutation.len() - 3..]
            .iter()
            .all(|event| event.outcome.status == OutcomeStatus::Failed)
    {
        return Some(MutationTrigger {
            reason: "mutation consecutive failures".to_string(),
        });
    }
    None
}

fn personality_mutation(param: PersonalityParam, delta: f64, reason: &str) -> PersonalityMutation {
    PersonalityMutation {
        kind: AssetKind::PersonalityMutation,
        param,
        delta,
        reason: reason.to_string(),
    }
}

/// Reads and writes `personality_state.json`.
pub struct PersonalityStore {
    path: PathBuf,
    config: PersonalityConfig,
    now: Option<DateTime<Utc>>,
}

impl PersonalityStore {
    pub fn new<P: Into<PathBuf>>(evolution_dir: P, config: PersonalityConfig) -> Self {
        Self {
            path: evolution_dir.into().join("personality_state.json"),
            config,
            now: None,
        }
    }

    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn now_iso(&self) -> String {
        self.now
            .unwrap_or_else(Utc::now)
            .to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    /// Missing or corrupt files yield the default model.
    pub fn load(&self) -> PersonalityModel {
        let parsed = fs::read_to_string(&self.path)
            .ok()
            .filter(|raw| !raw.trim().is_empty())
            .and_then(|raw| serde_json::from_str::<PersonalityModel>(&raw).ok());
        match parsed {
            Some(mut model) => {
                model.version = model_version();
                model.current = model.current.normalized();
                if model.updated_at.is_empty() {
                    model.updated_at = self.now_iso();
                }
                model
            }
            None => PersonalityModel {
                version: model_version(),
                current: PersonalityState::default(),
                stats: BTreeMap::new(),
                history: Vec::new(),
                updated_at: self.now_iso(),
            },
        }
    }

    pub fn save(&self, model: &PersonalityModel) -> Result<PersonalityModel, PersonalityError> {
        let start = model.history.len().saturating_sub(self.config.history_limit);
        let out = PersonalityModel {
            version: model_version(),
            current: model.current.normalized(),
            stats: model.stats.clone(),
            history: model.history[start..].to_vec(),
            updated_at: self.now_iso(),
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let mut bytes = serde_json::to_vec_pretty(&out).map_err(serde_err)?;
        bytes.push(b'\n');
        fs::write(&tmp, bytes).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(out)
    }

    /// Nudges toward the best-known configuration, applies triggered
    /// mutations, and persists the new current state.
    pub fn select_for_run<S: AsRef<str>>(
        &self,
        drift_enabled: bool,
        signals: &[S],
        recent_events: &[EvolutionEvent],
    ) -> Result<PersonalitySelection, PersonalityError> {
        let mut model = self.load();
        let base = model.current.normalized();
        let best = choose_best_known(&model.stats);
        let mut mutations = Vec::new();

        if let Some(best) = &best {
            let target = parse_key_to_state(&best.key);
            let nudges = param_deltas(&base, &target)
                .into_iter()
                .filter(|(_, delta)| delta.abs() >= NATURAL_SELECTION_MIN_DELTA)
                .take(MAX_MUTATIONS_PER_STEP)
                .map(|(param, delta)| {
                    personality_mutation(
                        param,
                        delta.clamp(-NATURAL_SELECTION_CLIP, NATURAL_SELECTION_CLIP),
                        "natural_selection",
                    )
                })
                .collect::<Vec<_>>();
            let applied = apply_personality_mutations(&base, &nudges);
            model.current = applied.state;
            mutations.extend(applied.applied);
        }

        let trigger = should_trigger_mutation(drift_enabled, recent_events);
        if let Some(trigger) = &trigger {
            let proposals =
                propose_mutations(&model.current, &trigger.reason, drift_enabled, signals);
            let applied = apply_personality_mutations(&model.current, &proposals);
            model.current = applied.state;
            mutations.extend(applied.applied);
        }

        let saved = self.save(&model)?;
        let key = saved.current.key();
        let known = saved.stats.contains_key(&key);
        log::info!(
            "personality_selected key={} known={} mutations={}",
            key,
            known,
            mutations.len()
        );
        Ok(PersonalitySelection {
            state: saved.current,
            key,
            known,
            mutations,
            meta: ModelMeta {
                best_known_key: best.as_ref().map(|best| best.key.clone()),
                best_known_score: best
                    .as_ref()
                    .map(|best| best.score)
                    .filter(|score| score.is_finite()),
                triggered: trigger,
            },
        })
    }

    /// Records one outcome under the quantized key of `state` (or the current state).
    pub fn update_stats(
        &self,
        state: Option<&PersonalityState>,
        outcome: Option<OutcomeStatus>,
        score: Option<f64>,
        notes: Option<&str>,
    ) -> Result<(String, PersonalityStats), PersonalityError> {
        let mut model = self.load();
        let state = state.cloned().unwrap_or_else(|| model.current.clone());
        let key = state.normalized().key();
        let now = self.now_iso();
        let entry = model.stats.entry(key.clone()).or_default();

        match outcome {
            Some(OutcomeStatus::Success) => entry.success += 1,
            Some(OutcomeStatus::Failed) => entry.fail += 1,
            None => {}
        }
        let score = score.filter(|score| score.is_finite()).map(clamp01);
        if let Some(score) = score {
            let n = entry.n + 1;
            let previous = if entry.avg_score.is_finite() {
                entry.avg_score
            } else {
                neutral_score()
            };
            entry.avg_score = previous + (score - previous) / n as f64;
            entry.n = n;
        }
        entry.updated_at = Some(now.clone());
        let stats = entry.clone();

        model.history.push(HistoryEntry {
            at: now,
            key: key.clone(),
            outcome: outcome
                .map(|status| status.as_str().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            score,
            notes: notes.map(|notes| clip(notes, 220)),
        });
        self.save(&model)?;
        Ok((key, stats))
    }
}

fn io_err(err: std::io::Error) -> PersonalityError {
    PersonalityError::Io(err.to_string())
}

fn serde_err(err: serde_json::Error) -> PersonalityError {
    PersonalityError::Serde(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gep_evolution::next_id;
    use serde_json::json;

    fn temp_root(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("gep-personality-{name}-{}", next_id("t")))
    }

    fn failed_event(with_mutation: bool) -> EvolutionEvent {
        serde_json::from_value(json!({
            "type": "EvolutionEvent",
            "id": next_id("evt"),
            "intent": "repair",
            "mutation_id": if with_mutation { json!("mut_1") } else { Value::Null },
            "outcome": {"status": "failed", "score": 0.2},
        }))
        .unwrap()
    }

    #[test]
    fn validity_requires_type_and_unit_range() {
        let mut value = serde_json::to_value(PersonalityState::default()).unwrap();
        assert!(is_valid_personality_state(&value));
        value["rigor"] = json!(1.5);
        assert!(!is_valid_personality_state(&value));
        assert!(!is_valid_personality_state(&json!({"rigor": 0.5})));
    }

    #[test]
    fn key_round_trips_through_parse() {
        let state = parse_key_to_state("rigor=0.9|creativity=0.1|bogus=3|obedience=x");
        assert!((state.rigor - 0.9).abs() < 1e-9);
        assert!((state.creativity - 0.1).abs() < 1e-9);
        assert_eq!(state.obedience, 0.0);
        assert_eq!(state.verbosity, PersonalityState::default().verbosity);
    }

    #[test]
    fn mutations_are_clipped_and_capped_at_two() {
        let proposals = vec![
            personality_mutation(PersonalityParam::Rigor, 0.5, "big"),
            personality_mutation(PersonalityParam::Creativity, -0.05, "small"),
            personality_mutation(PersonalityParam::Verbosity, 0.1, "ignored"),
        ];
        let applied = apply_personality_mutations(&PersonalityState::default(), &proposals);
        assert_eq!(applied.applied.len(), 2);
        assert_eq!(applied.applied[0].delta, 0.2);
        assert!((applied.state.rigor - 0.9).abs() < 1e-9);
        assert_eq!(applied.state.verbosity, PersonalityState::default().verbosity);
    }

    #[test]
    fn proposals_follow_signal_category() {
        let state = PersonalityState::default();
        let errors = propose_mutations(&state, "", false, &["log_error"]);
        assert_eq!(errors[0].param, PersonalityParam::Rigor);
        assert_eq!(errors[1].delta, -0.1);

        let opportunity = propose_mutations(&state, "", false, &["capability_gap"]);
        assert_eq!(opportunity[0].param, PersonalityParam::Creativity);
        assert_eq!(opportunity[0].reason, "opportunity signal detected");

        let saturated = PersonalityState {
            obedience: 0.97,
            ..PersonalityState::default()
        };
        let drift = propose_mutations(&saturated, "why", false, &["protocol_drift"]);
        assert_eq!(drift[0].param, PersonalityParam::Creativity);
        assert_eq!(drift[0].reason, "obedience saturated");
    }

    #[test]
    fn triggers_on_failure_streaks() {
        assert!(should_trigger_mutation(true, &[]).is_some());
        let events = vec![failed_event(false), failed_event(false), failed_event(false)];
        assert!(should_trigger_mutation(false, &events).is_none());
        let with_mutations = vec![failed_event(true), failed_event(true), failed_event(true)];
        assert_eq!(
            should_trigger_mutation(false, &with_mutations).unwrap().reason,
            "mutation consecutive failures"
        );
        let mut four = events.clone();
        four.push(failed_event(false));
        assert_eq!(
            should_trigger_mutation(false, &four).unwrap().reason,
            "long failure streak"
        );
    }

    #[test]
    fn natural_selection_moves_toward_best_known() {
        let store = PersonalityStore::new(temp_root("select"), PersonalityConfig::default());
        let mut model = store.load();
        model.stats.insert(
            "rigor=0.9|creativity=0.3|verbosity=0.3|risk_tolerance=0.2|obedience=0.9".into(),
            PersonalityStats {
                success: 6,
                fail: 0,
                avg_score: 0.9,
                n: 6,
                updated_at: None,
            },
        );
        store.save(&model).unwrap();

        let selection = store.select_for_run(false, &["stable"], &[]).unwrap();
        assert_eq!(selection.mutations.len(), 2);
        assert!(selection
            .mutations
            .iter()
            .all(|mutation| mutation.reason == "natural_selection"));
        assert!((selection.state.rigor - 0.8).abs() < 1e-9);
        assert!((selection.state.risk_tolerance - 0.3).abs() < 1e-9);
        assert!(selection.meta.triggered.is_none());
        assert_eq!(store.load().current, selection.state);
    }

    #[test]
    fn stats_track_running_average_and_bounded_history() {
        let store = PersonalityStore::new(
            temp_root("stats"),
            PersonalityConfig { history_limit: 2 },
        );
        let state = PersonalityState::default();
        store
            .update_stats(Some(&state), Some(OutcomeStatus::Success), Some(0.85), None)
            .unwrap();
        store
            .update_stats(Some(&state), Some(OutcomeStatus::Failed), Some(0.2), None)
            .unwrap();
        let (key, stats) = store
            .update_stats(Some(&state), None, None, Some("note"))
            .unwrap();
        assert_eq!(key, state.key());
        assert_eq!((stats.success, stats.fail, stats.n), (1, 1, 2));
        assert!((stats.avg_score - 0.525).abs() < 1e-9);
        let model = store.load();
        assert_eq!(model.history.len(), 2);
        assert_eq!(model.history[1].outcome, "unknown");
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let root = temp_root("corrupt");
        fs::create_dir_all(&root).unwrap();
        let store = PersonalityStore::new(&root, PersonalityConfig::default());
        fs::write(store.path(), "{not json").unwrap();
        assert_eq!(store.load().current, PersonalityState::default());
    }
}
