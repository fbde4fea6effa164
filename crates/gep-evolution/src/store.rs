use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::{
    io_err, serde_err, Capsule, ContentAddressed, EventId, EvolutionError,
    EvolutionEvent, Gene, GeneCategory, GeneConstraints, ValidationCommand, ValidationProgram,
    ValidationReport, ValidationStep,
};

pub trait AssetStore: Send + Sync {
    fn ensure_asset_files(&self) -> Result<(), EvolutionError>;
    /// `genes.json` merged with `genes.jsonl`; the overlay wins on duplicate ids.
    fn load_genes(&self) -> Vec<Gene>;
    fn load_capsules(&self) -> Vec<Capsule>;
    fn upsert_gene(&self, gene: Gene) -> Result<Gene, EvolutionError>;
    fn append_gene(&self, gene: Gene) -> Result<Gene, EvolutionError>;
    fn upsert_capsule(&self, capsule: Capsule) -> Result<Capsule, EvolutionError>;
    fn append_event(&self, event: &EvolutionEvent) -> Result<(), EvolutionError>;
    fn append_validation_report(&self, report: &ValidationReport) -> Result<(), EvolutionError>;
    fn read_all_events(&self) -> Vec<Value>;
    fn append_candidate(&self, candidate: &Value) -> Result<(), EvolutionError>;
    fn append_external_candidate(&self, asset: &Value) -> Result<(), EvolutionError>;
    fn read_recent_candidates(&self, limit: usize) -> Vec<Value>;
    fn read_recent_external_candidates(&self, limit: usize) -> Vec<Value>;

    fn read_evolution_events(&self) -> Vec<EvolutionEvent> {
        self.read_all_events()
            .into_iter()
            .filter(|value| value.get("type").and_then(Value::as_str) == Some("EvolutionEvent"))
            .filter_map(|value| serde_json::from_value(value).ok())
            .collect()
    }

    fn last_event_id(&self) -> Option<EventId> {
        self.read_all_events()
            .last()
            .and_then(|value| value.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

pub struct JsonAssetStore {
    root_dir: PathBuf,
    lock: Mutex<()>,
}

impl JsonAssetStore {
    pub fn new<P: Into<PathBuf>>(root_dir: P) -> Self {
        Self {
            root_dir: root_dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn genes_path(&self) -> PathBuf {
        self.root_dir.join("genes.json")
    }

    pub fn capsules_path(&self) -> PathBuf {
        self.root_dir.join("capsules.json")
    }

    pub fn events_path(&self) -> PathBuf {
        self.root_dir.join("events.jsonl")
    }

    fn genes_jsonl_path(&self) -> PathBuf {
        self.root_dir.join("genes.jsonl")
    }

    fn capsules_jsonl_path(&self) -> PathBuf {
        self.root_dir.join("capsules.jsonl")
    }

    fn candidates_path(&self) -> PathBuf {
        self.root_dir.join("candidates.jsonl")
    }

    fn external_candidates_path(&self) -> PathBuf {
        self.root_dir.join("external_candidates.jsonl")
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>, EvolutionError> {
        self.lock
            .lock()
            .map_err(|_| EvolutionError::Io("asset store lock poisoned".into()))
    }

    fn append_line<T: Serialize + ?Sized>(
        &self,
        path: &Path,
        value: &T,
    ) -> Result<(), EvolutionError> {
        let _guard = self.guard()?;
        fs::create_dir_all(&self.root_dir).map_err(io_err)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_err)?;
        let line = serde_json::to_string(value).map_err(serde_err)?;
        file.write_all(line.as_bytes()).map_err(io_err)?;
        file.write_all(b"\n").map_err(io_err)?;
        Ok(())
    }

    fn read_gene_document(&self) -> (u64, Vec<Value>) {
        match read_json_if_exists(&self.genes_path()) {
            Some(document) => (document_version(&document), document_items(&document, "genes")),
            None => (1, default_genes_document_items()),
        }
    }

    fn read_capsule_document(&self) -> (u64, Vec<Value>) {
        match read_json_if_exists(&self.capsules_path()) {
            Some(document) => (
                document_version(&document),
                document_items(&document, "capsules"),
            ),
            None => (1, Vec::new()),
        }
    }
}

impl AssetStore for JsonAssetStore {
    fn ensure_asset_files(&self) -> Result<(), EvolutionError> {
        let _guard = self.guard()?;
        fs::create_dir_all(&self.root_dir).map_err(io_err)?;
        if !self.genes_path().exists() {
            write_json_atomic(
                &self.genes_path(),
                &json!({"version": 1, "genes": default_genes_document_items()}),
            )?;
        }
        if !self.capsules_path().exists() {
            write_json_atomic(&self.capsules_path(), &json!({"version": 1, "capsules": []}))?;
        }
        for path in [
            self.genes_jsonl_path(),
            self.events_path(),
            self.candidates_path(),
        ] {
            if !path.exists() {
                if let Err(err) = fs::write(&path, "") {
                    log::warn!(
                        "asset_store_create_failed path={} error={}",
                        path.display(),
                        err
                    );
                }
            }
        }
        Ok(())
    }

    fn load_genes(&self) -> Vec<Gene> {
        let (_, documents) = self.read_gene_document();
        let overlay = read_jsonl(&self.genes_jsonl_path())
            .into_iter()
            .filter(|value| value.get("type").and_then(Value::as_str) == Some("Gene"));
        merge_by_id(documents.into_iter().chain(overlay))
    }

    fn load_capsules(&self) -> Vec<Capsule> {
        let (_, documents) = self.read_capsule_document();
        let overlay = read_jsonl(&self.capsules_jsonl_path());
        merge_by_id(documents.into_iter().chain(overlay))
    }

    fn upsert_gene(&self, mut gene: Gene) -> Result<Gene, EvolutionError> {
        gene.ensure_schema_fields()?;
        let _guard = self.guard()?;
        let (version, mut genes) = self.read_gene_document();
        let value = serde_json::to_value(&gene).map_err(serde_err)?;
        replace_or_push(&mut genes, &gene.id, value);
        write_json_atomic(
            &self.genes_path(),
            &json!({"version": version, "genes": genes}),
        )?;
        Ok(gene)
    }

    fn append_gene(&self, mut gene: Gene) -> Result<Gene, EvolutionError> {
        gene.ensure_schema_fields()?;
        self.append_line(&self.genes_jsonl_path(), &gene)?;
        Ok(gene)
    }

    fn upsert_capsule(&self, mut capsule: Capsule) -> Result<Capsule, EvolutionError> {
        capsule.ensure_schema_fields()?;
        let _guard = self.guard()?;
        let (version, mut capsules) = self.read_capsule_document();
        let value = serde_json::to_value(&capsule).map_err(serde_err)?;
        replace_or_push(&mut capsules, &capsule.id, value);
        write_json_atomic(
            &self.capsules_path(),
            &json!({"version": version, "capsules": capsules}),
        )?;
        Ok(capsule)
    }

    fn append_event(&self, event: &EvolutionEvent) -> Result<(), EvolutionError> {
        self.append_line(&self.events_path(), event)
    }

    fn append_validation_report(&self, report: &ValidationReport) -> Result<(), EvolutionError> {
        self.append_line(&self.events_path(), report)
    }

    fn read_all_events(&self) -> Vec<Value> {
        read_jsonl(&self.events_path())
    }

    fn append_candidate(&self, candidate: &Value) -> Result<(), EvolutionError> {
        self.append_line(&self.candidates_path(), candidate)
    }

    fn append_external_candidate(&self, asset: &Value) -> Result<(), EvolutionError> {
        self.append_line(&self.external_candidates_path(), asset)
    }

    fn read_recent_candidates(&self, limit: usize) -> Vec<Value> {
        tail(read_jsonl(&self.candidates_path()), limit)
    }

    fn read_recent_external_candidates(&self, limit: usize) -> Vec<Value> {
        tail(read_jsonl(&self.external_candidates_path()), limit)
    }
}

pub fn default_genes() -> Vec<Gene> {
    let mut repair = Gene::new("gene_gep_repair_from_errors", GeneCategory::Repair);
    repair.signals_match = strings(["error", "exception", "failed", "unstable"]);
    repair.preconditions = strings(["signals contains error-related indicators"]);
    repair.strategy = strings([
        "Extract structured signals from logs and user instructions",
        "Select an existing Gene by signals match (no improvisation)",
        "Estimate blast radius (files, lines) before editing",
        "Apply smallest reversible patch",
        "Validate using declared validation steps; rollback on failure",
        "Solidify knowledge: append EvolutionEvent, update Gene/Capsule store",
    ]);
    repair.constraints = GeneConstraints {
        max_files: Some(12),
        forbidden_paths: strings([".git", "node_modules"]),
    };
    repair.validation = vec![
        node_require_check(&["src/evolve", "src/gep/solidify"]),
        node_require_check(&["src/gep/selector", "src/gep/memoryGraph"]),
    ];

    let mut optimize = Gene::new("gene_gep_optimize_prompt_and_assets", GeneCategory::Optimize);
    optimize.signals_match = strings(["protocol", "gep", "prompt", "audit", "reusable"]);
    optimize.preconditions = strings(["need stricter, auditable evolution protocol outputs"]);
    optimize.strategy = strings([
        "Extract signals and determine selection rationale via Selector JSON",
        "Prefer reusing existing Gene/Capsule; only create if no match exists",
        "Refactor prompt assembly to embed assets (genes, capsules, parent event)",
        "Reduce noise and ambiguity; enforce strict output schema",
        "Validate by running node index.js run and ensuring no runtime errors",
        "Solidify: record EvolutionEvent, update Gene definitions, create Capsule on success",
    ]);
    optimize.constraints = GeneConstraints {
        max_files: Some(20),
        forbidden_paths: strings([".git", "node_modules"]),
    };
    optimize.validation = vec![node_require_check(&["src/evolve", "src/gep/prompt"])];

    vec![repair, optimize]
}

fn node_require_check(modules: &[&str]) -> ValidationStep {
    let checks = modules
        .iter()
        .map(|module| format!("require('./{module}')"))
        .collect::<Vec<_>>();
    ValidationStep::Command(ValidationCommand::new(
        ValidationProgram::Node,
        ["-e".to_string(), format!("{}; console.log('ok')", checks.join("; "))],
    ))
}

fn strings<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|item| item.to_string()).collect()
}

fn default_genes_document_items() -> Vec<Value> {
    default_genes()
        .iter()
        .filter_map(|gene| serde_json::to_value(gene).ok())
        .collect()
}

fn read_json_if_exists(path: &Path) -> Option<Value> {
    let raw = fs::read_to_string(path).ok()?;
    if raw.trim().is_empty() {
        return None;
    }
    serde_json::from_str(&raw).ok()
}

fn document_version(document: &Value) -> u64 {
    document.get("version").and_then(Value::as_u64).unwrap_or(1)
}

fn document_items(document: &Value, key: &str) -> Vec<Value> {
    document
        .get(key)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn read_jsonl(path: &Path) -> Vec<Value> {
    let Ok(raw) = fs::read_to_string(path) else {
        return Vec::new();
    };
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

fn tail(mut items: Vec<Value>, limit: usize) -> Vec<Value> {
    let start = items.len().saturating_sub(limit);
    items.split_off(start)
}

fn merge_by_id<T: DeserializeOwned, I: IntoIterator<Item = Value>>(values: I) -> Vec<T> {
    let mut order: Vec<String> = Vec::new();
    let mut by_id: HashMap<String, Value> = HashMap::new();
    for value in values {
        let Some(id) = value_id(&value) else {
            continue;
        };
        if !by_id.contains_key(&id) {
            order.push(id.clone());
        }
        by_id.insert(id, value);
    }
    order
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .filter_map(|value| serde_json::from_value(value).ok())
        .collect()
}

fn value_id(value: &Value) -> Option<String> {
    match value.get("id")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn replace_or_push(items: &mut Vec<Value>, id: &str, value: Value) {
    match items
        .iter()
        .position(|item| value_id(item).as_deref() == Some(id))
    {
        Some(index) => items[index] = value,
        None => items.push(value),
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), EvolutionError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp_path = PathBuf::from(tmp);
    let mut bytes = serde_json::to_vec_pretty(value).map_err(serde_err)?;
    bytes.push(b'\n');
    fs::write(&tmp_path, bytes).map_err(io_err)?;
    fs::rename(&tmp_path, path).map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{next_id, Outcome, OutcomeStatus};

    fn temp_root(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("gep-evolution-{name}-{}", next_id("t")))
    }

    fn sample_capsule(id: &str) -> Capsule {
        serde_json::from_value(json!({
            "type": "Capsule",
            "id": id,
            "trigger": ["log_error"],
            "gene": "gene_gep_repair_from_errors",
            "summary": "fixed",
            "confidence": 0.85,
            "blast_radius": {"files": 1, "lines": 4},
            "outcome": {"status": "success", "score": 0.85}
        }))
        .unwrap()
    }

    #[test]
    fn missing_files_fall_back_to_default_genes() {
        let store = JsonAssetStore::new(temp_root("defaults"));
        let genes = store.load_genes();
        assert_eq!(genes.len(), 2);
        assert_eq!(genes[0].id, "gene_gep_repair_from_errors");
        assert_eq!(genes[1].constraints.max_files, Some(20));
        assert!(store.load_capsules().is_empty());
        assert_eq!(store.last_event_id(), None);
    }

    #[test]
    fn ensure_asset_files_creates_layout_once() {
        let root = temp_root("layout");
        let store = JsonAssetStore::new(&root);
        store.ensure_asset_files().unwrap();
        for name in [
            "genes.json",
            "capsules.json",
            "genes.jsonl",
            "events.jsonl",
            "candidates.jsonl",
        ] {
            assert!(root.join(name).exists(), "{name} missing");
        }
        fs::write(root.join("capsules.json"), "{\"version\":1,\"capsules\":[]}").unwrap();
        store.upsert_capsule(sample_capsule("c1")).unwrap();
        store.ensure_asset_files().unwrap();
        assert_eq!(store.load_capsules().len(), 1);
    }

    #[test]
    fn corrupt_documents_degrade_to_defaults() {
        let root = temp_root("corrupt");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("genes.json"), "{not json").unwrap();
        fs::write(root.join("events.jsonl"), "garbage\n{\"id\":\"evt_1\"}\n").unwrap();
        let store = JsonAssetStore::new(&root);
        assert_eq!(store.load_genes().len(), 2);
        assert_eq!(store.read_all_events().len(), 1);
        assert_eq!(store.last_event_id().as_deref(), Some("evt_1"));
    }

    #[test]
    fn jsonl_overlay_wins_on_duplicate_gene_ids() {
        let root = temp_root("overlay");
        let store = JsonAssetStore::new(&root);
        store.ensure_asset_files().unwrap();
        let mut gene = default_genes().remove(0);
        gene.signals_match = vec!["timeout".into()];
        gene.asset_id = None;
        store.append_gene(gene).unwrap();
        fs::OpenOptions::new()
            .append(true)
            .open(root.join("genes.jsonl"))
            .unwrap()
            .write_all(b"{\"type\":\"Capsule\",\"id\":\"gene_gep_repair_from_errors\"}\n")
            .unwrap();

        let genes = store.load_genes();
        assert_eq!(genes.len(), 2);
        assert_eq!(genes[0].signals_match, vec!["timeout".to_string()]);
        assert_eq!(store.load_genes(), genes);
    }

    #[test]
    fn repeated_loads_merge_capsule_overlay_identically() {
        let root = temp_root("capsule-overlay");
        let store = JsonAssetStore::new(&root);
        store.upsert_capsule(sample_capsule("c1")).unwrap();
        store.upsert_capsule(sample_capsule("c2")).unwrap();
        let mut overlay = serde_json::to_value(sample_capsule("c1")).unwrap();
        overlay["summary"] = json!("fixed again");
        let mut lines = serde_json::to_string(&overlay).unwrap();
        lines.push('\n');
        fs::write(root.join("capsules.jsonl"), lines).unwrap();

        let first = store.load_capsules();
        let second = store.load_capsules();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].id, "c1");
        assert_eq!(first[0].summary, "fixed again");
        assert_eq!(first[1].id, "c2");

        let genes = store.load_genes();
        assert_eq!(store.load_genes(), genes);
    }

    #[test]
    fn upsert_replaces_by_id_and_fills_schema_fields() {
        let store = JsonAssetStore::new(temp_root("upsert"));
        let stored = store.upsert_capsule(sample_capsule("c1")).unwrap();
        assert_eq!(stored.schema_version, crate::SCHEMA_VERSION);
        assert!(stored.has_valid_asset_id());

        let mut updated = sample_capsule("c1");
        updated.outcome = Outcome {
            status: OutcomeStatus::Failed,
            score: 0.2,
        };
        store.upsert_capsule(updated).unwrap();
        let capsules = store.load_capsules();
        assert_eq!(capsules.len(), 1);
        assert_eq!(capsules[0].outcome.status, OutcomeStatus::Failed);
        assert!(!store.capsules_path().with_extension("json.tmp").exists());
    }

    #[test]
    fn recent_candidates_respect_limit() {
        let store = JsonAssetStore::new(temp_root("candidates"));
        for index in 0..25 {
            store
                .append_candidate(&json!({"type": "CapabilityCandidate", "id": index}))
                .unwrap();
        }
        let recent = store.read_recent_candidates(20);
        assert_eq!(recent.len(), 20);
        assert_eq!(recent[0]["id"], json!(5));
        assert!(store.read_recent_external_candidates(50).is_empty());
    }
}
