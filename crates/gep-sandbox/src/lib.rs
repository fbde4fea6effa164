//! Shell-free command execution, git workspace probes, validation, canary, and rollback.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use gep_evolution::{
    clip, normalize_rel_path, now_ms, path_under_any, BlastMeasurement, ValidationStep,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{timeout, Duration};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxPolicy {
    pub allowed_programs: Vec<String>,
    pub validation_timeout_ms: u64,
    pub canary_timeout_ms: u64,
    pub git_timeout_ms: u64,
    pub max_output_bytes: usize,
    /// Relative to the repo root.
    pub canary_script: String,
    pub denied_env_prefixes: Vec<String>,
}

impl SandboxPolicy {
    pub fn gep_default() -> Self {
        Self {
            allowed_programs: vec!["git".into(), "node".into(), "npm".into(), "npx".into()],
            validation_timeout_ms: 180_000,
            canary_timeout_ms: 30_000,
            git_timeout_ms: 60_000,
            max_output_bytes: 4_000,
            canary_script: "src/canary.js".into(),
            denied_env_prefixes: vec!["TOKEN".into(), "SECRET".into()],
        }
    }
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self::gep_default()
    }
}

#[derive(Clone, Debug)]
pub struct CommandExecution {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox I/O error: {0}")]
    Io(String),
    #[error("command denied by policy: {0}")]
    CommandDenied(String),
    #[error("command timed out: {0}")]
    Timeout(String),
}

pub async fn execute_command(
    policy: &SandboxPolicy,
    workdir: &Path,
    program: &str,
    args: &[String],
    timeout_ms: u64,
) -> Result<CommandExecution, SandboxError> {
    if !policy
        .allowed_programs
        .iter()
        .any(|allowed| allowed == program)
    {
        return Err(SandboxError::CommandDenied(program.to_string()));
    }

    let started = Instant::now();
    let mut command = tokio::process::Command::new(program);
    command.kill_on_drop(true);
    command.args(args);
    command.current_dir(workdir);
    command.stdin(std::process::Stdio::null());
    command.stdout(std::process::Stdio::piped());
    command.stderr(std::process::Stdio::piped());
    for (key, _) in std::env::vars() {
        if policy
            .denied_env_prefixes
            .iter()
            .any(|prefix| key.to_ascii_uppercase().contains(prefix))
        {
            command.env_remove(&key);
        }
    }

    let output = timeout(Duration::from_millis(timeout_ms), command.output())
        .await
        .map_err(|_| SandboxError::Timeout(format!("{program} {}", args.join(" "))))?
        .map_err(io_err)?;

    Ok(CommandExecution {
        success: output.status.success(),
        exit_code: output.status.code(),
        stdout: truncate_to_limit(&output.stdout, policy.max_output_bytes),
        stderr: truncate_to_limit(&output.stderr, policy.max_output_bytes),
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

// ---------------------------------------------------------------------------
// Counted-path policy
// ---------------------------------------------------------------------------

/// Decides which changed files count toward the blast radius.
/// Excludes win over includes; a path matching neither is not counted.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CountedPathPolicy {
    pub exclude_exact: Vec<String>,
    pub exclude_prefixes: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub include_exact: Vec<String>,
    pub include_prefixes: Vec<String>,
    pub include_extensions: Vec<String>,
}

impl Default for CountedPathPolicy {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|item| item.to_string()).collect();
        Self {
            exclude_exact: strings(&[
                "event.json",
                "temp_gep_output.json",
                "temp_evolution_output.json",
                "evolution_error.log",
            ]),
            exclude_prefixes: strings(&[
                "logs/",
                "memory/",
                "assets/gep/",
                "out/",
                "temp/",
                "node_modules/",
            ]),
            exclude_patterns: strings(&[r"capsule", r"events?\.jsonl$"]),
            include_exact: strings(&["index.js", "package.json"]),
            include_prefixes: strings(&["src/", "scripts/", "config/"]),
            include_extensions: strings(&[
                ".js", ".cjs", ".mjs", ".ts", ".tsx", ".json", ".yaml", ".yml", ".toml", ".ini",
                ".sh",
            ]),
        }
    }
}

impl CountedPathPolicy {
    pub fn is_counted(&self, raw: &str) -> bool {
        let rel = normalize_rel_path(raw);
        if rel.is_empty() {
            return false;
        }
        if self.exclude_exact.iter().any(|exact| *exact == rel) {
            return false;
        }
        if path_under_any(&rel, &self.exclude_prefixes) {
            return false;
        }
        if self.exclude_patterns.iter().any(|pattern| {
            Regex::new(&format!("(?i){pattern}"))
                .map(|regex| regex.is_match(&rel))
                .unwrap_or(false)
        }) {
            return false;
        }
        if self.include_exact.iter().any(|exact| *exact == rel) {
            return true;
        }
        if path_under_any(&rel, &self.include_prefixes) {
            return true;
        }
        let lower = rel.to_ascii_lowercase();
        self.include_extensions
            .iter()
            .any(|ext| lower.ends_with(&ext.to_ascii_lowercase()))
    }
}

// ---------------------------------------------------------------------------
// Blast radius
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NumstatRow {
    pub file: String,
    pub added: usize,
    pub deleted: usize,
}

/// Parses `git diff --numstat`. Binary rows (`-`) count as zero; renames keep the new path.
pub fn parse_numstat_rows(text: &str) -> Vec<NumstatRow> {
    let mut rows = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parts = line.split('\t').collect::<Vec<_>>();
        if parts.len() < 3 {
            continue;
        }
        let added = parts[0].trim().parse::<usize>().unwrap_or(0);
        let deleted = parts[1].trim().parse::<usize>().unwrap_or(0);
        let file = renamed_target(&normalize_rel_path(&parts[2..].join("\t")));
        rows.push(NumstatRow {
            file,
            added,
            deleted,
        });
    }
    rows
}

/// `a.js => b.js` and `src/{old => new}/a.js` both resolve to the new path.
fn renamed_target(file: &str) -> String {
    if !file.contains("=>") {
        return file.to_string();
    }
    if let (Some(open), Some(close)) = (file.find('{'), file.rfind('}')) {
        if open < close {
            let inner = &file[open + 1..close];
            let right = inner.rsplit("=>").next().unwrap_or_default().trim();
            let joined = format!("{}{}{}", &file[..open], right, &file[close + 1..]);
            return normalize_rel_path(&joined.replace("//", "/"));
        }
    }
    normalize_rel_path(file.rsplit("=>").next().unwrap_or_default())
}

pub fn count_file_lines(path: &Path) -> usize {
    match fs::read(path) {
        Ok(bytes) if !bytes.is_empty() => 1 + bytes.iter().filter(|byte| **byte == b'\n').count(),
        _ => 0,
    }
}

/// Raw probe results a workspace collects before classification.
#[derive(Clone, Debug, Default)]
pub struct ChangeProbe {
    pub unstaged: Vec<String>,
    pub staged: Vec<String>,
    pub untracked: Vec<String>,
    pub numstat: Vec<NumstatRow>,
}

/// Pre-existing untracked files never count. Untracked lines come from `line_counter`.
pub fn compute_blast_radius<F>(
    probe: &ChangeProbe,
    baseline_untracked: &[String],
    policy: &CountedPathPolicy,
    line_counter: F,
) -> BlastMeasurement
where
    F: Fn(&str) -> usize,
{
    let baseline = baseline_untracked
        .iter()
        .map(|path| normalize_rel_path(path))
        .collect::<BTreeSet<_>>();
    let new_untracked = probe
        .untracked
        .iter()
        .map(|path| normalize_rel_path(path))
        .filter(|path| !path.is_empty() && !baseline.contains(path))
        .collect::<BTreeSet<_>>();

    let all_changed = probe
        .unstaged
        .iter()
        .chain(probe.staged.iter())
        .map(|path| normalize_rel_path(path))
        .filter(|path| !path.is_empty() && !baseline.contains(path))
        .chain(new_untracked.iter().cloned())
        .collect::<BTreeSet<_>>();

    let (changed_files, ignored_files): (Vec<String>, Vec<String>) = all_changed
        .iter()
        .cloned()
        .partition(|path| policy.is_counted(path));

    let mut lines = probe
        .numstat
        .iter()
        .filter(|row| policy.is_counted(&row.file))
        .map(|row| row.added + row.deleted)
        .sum::<usize>();
    for path in new_untracked.iter().filter(|path| policy.is_counted(path)) {
        lines += line_counter(path);
    }

    BlastMeasurement {
        files: changed_files.len(),
        lines,
        changed_files,
        ignored_files,
        all_changed_files: all_changed.into_iter().collect(),
    }
}

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RollbackReport {
    pub deleted: Vec<String>,
    pub skipped: Vec<String>,
    pub removed_dirs: Vec<String>,
}

#[async_trait]
pub trait Workspace: Send + Sync {
    fn root(&self) -> &Path;
    async fn untracked_files(&self) -> Vec<String>;
    async fn head(&self) -> Option<String>;
    async fn measure_blast(
        &self,
        baseline_untracked: &[String],
        policy: &CountedPathPolicy,
    ) -> BlastMeasurement;
    async fn rollback_tracked(&self);
    async fn rollback_new_untracked(
        &self,
        baseline_untracked: &[String],
        protected: &[String],
    ) -> RollbackReport;
}

pub struct GitWorkspace {
    root: PathBuf,
    policy: SandboxPolicy,
}

impl GitWorkspace {
    pub fn new<P: Into<PathBuf>>(root: P, policy: SandboxPolicy) -> Self {
        Self {
            root: root.into(),
            policy,
        }
    }

    async fn git(&self, args: &[&str]) -> Option<CommandExecution> {
        let args = args.iter().map(|arg| arg.to_string()).collect::<Vec<_>>();
        match execute_command(
            &self.policy,
            &self.root,
            "git",
            &args,
            self.policy.git_timeout_ms,
        )
        .await
        {
            Ok(execution) => Some(execution),
            Err(err) => {
                log::warn!("git probe failed args={:?} error={}", args, err);
                None
            }
        }
    }

    async fn git_lines(&self, args: &[&str]) -> Vec<String> {
        match self.git(args).await {
            Some(execution) if execution.success => execution
                .stdout
                .lines()
                .map(normalize_rel_path)
                .filter(|line| !line.is_empty())
                .collect(),
            _ => Vec::new(),
        }
    }

    async fn git_text(&self, args: &[&str]) -> String {
        match self.git(args).await {
            Some(execution) if execution.success => execution.stdout,
            _ => String::new(),
        }
    }
}

#[async_trait]
impl Workspace for GitWorkspace {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn untracked_files(&self) -> Vec<String> {
        self.git_lines(&["ls-files", "--others", "--exclude-standard"])
            .await
    }

    async fn head(&self) -> Option<String> {
        let head = self.git_text(&["rev-parse", "HEAD"]).await;
        let head = head.trim();
        (!head.is_empty()).then(|| head.to_string())
    }

    async fn measure_blast(
        &self,
        baseline_untracked: &[String],
        policy: &CountedPathPolicy,
    ) -> BlastMeasurement {
        let mut numstat = parse_numstat_rows(&self.git_text(&["diff", "--numstat"]).await);
        numstat.extend(parse_numstat_rows(
            &self.git_text(&["diff", "--cached", "--numstat"]).await,
        ));
        let probe = ChangeProbe {
            unstaged: self.git_lines(&["diff", "--name-only"]).await,
            staged: self.git_lines(&["diff", "--cached", "--name-only"]).await,
            untracked: self.untracked_files().await,
            numstat,
        };
        compute_blast_radius(&probe, baseline_untracked, policy, |rel| {
            count_file_lines(&self.root.join(rel))
        })
    }

    async fn rollback_tracked(&self) {
        self.git(&["restore", "--staged", "--worktree", "."]).await;
        self.git(&["reset", "--hard"]).await;
    }

    async fn rollback_new_untracked(
        &self,
        baseline_untracked: &[String],
        protected: &[String],
    ) -> RollbackReport {
        let current = self.untracked_files().await;
        remove_new_untracked(&self.root, &current, baseline_untracked, protected)
    }
}

/// Deletes files untracked now but not at baseline, then prunes emptied parents deepest first.
/// Protected paths and anything resolving outside `root` are left alone.
pub fn remove_new_untracked(
    root: &Path,
    current_untracked: &[String],
    baseline_untracked: &[String],
    protected: &[String],
) -> RollbackReport {
    let baseline = baseline_untracked
        .iter()
        .map(|path| normalize_rel_path(path))
        .collect::<BTreeSet<_>>();
    let mut report = RollbackReport::default();
    let mut dirs = BTreeSet::new();

    for rel in current_untracked.iter().map(|path| normalize_rel_path(path)) {
        if rel.is_empty() || baseline.contains(&rel) {
            continue;
        }
        if path_under_any(&rel, protected) {
            log::warn!("rollback skipped protected path path={}", rel);
            report.skipped.push(rel);
            continue;
        }
        if !is_within(root, &rel) {
            report.skipped.push(rel);
            continue;
        }
        let abs = root.join(&rel);
        if !abs.is_file() {
            continue;
        }
        if fs::remove_file(&abs).is_ok() {
            let mut parent = Path::new(&rel).parent();
            while let Some(dir) = parent {
                if dir.as_os_str().is_empty() {
                    break;
                }
                dirs.insert(dir.to_string_lossy().replace('\\', "/"));
                parent = dir.parent();
            }
            report.deleted.push(rel);
        }
    }

    let mut dirs = dirs.into_iter().collect::<Vec<_>>();
    dirs.sort_by_key(|dir| std::cmp::Reverse(dir.matches('/').count()));
    for dir in dirs {
        let abs = root.join(&dir);
        let empty = fs::read_dir(&abs)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if empty && fs::remove_dir(&abs).is_ok() {
            report.removed_dirs.push(dir);
        }
    }

    if !report.deleted.is_empty() {
        log::info!(
            "rollback removed new untracked files deleted={} removed_dirs={}",
            report.deleted.len(),
            report.removed_dirs.len()
        );
    }
    report
}

/// Lexical check: no absolute paths, no `..` escaping the root.
pub fn is_within(root: &Path, rel: &str) -> bool {
    let candidate = Path::new(rel);
    if candidate.is_absolute() {
        return candidate.starts_with(root);
    }
    let mut depth = 0i64;
    for component in candidate.components() {
        match component {
            std::path::Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            std::path::Component::Normal(_) => depth += 1,
            std::path::Component::CurDir => {}
            _ => return false,
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

pub const BLOCKED_MESSAGE: &str = "BLOCKED: validation command rejected by safety check (allowed prefixes: node/npm/npx; shell operators prohibited)";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CommandResult {
    pub cmd: String,
    pub ok: bool,
    pub out: String,
    pub err: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ValidationRun {
    pub ok: bool,
    pub results: Vec<CommandResult>,
    pub started_at: u128,
    pub finished_at: u128,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CanaryResult {
    pub ok: bool,
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub out: String,
    pub err: String,
}

#[async_trait]
pub trait Validator: Send + Sync {
    /// Stops at the first rejected or failing step.
    async fn run_validations(&self, steps: &[ValidationStep]) -> ValidationRun;
    async fn run_canary(&self) -> CanaryResult;
}

pub struct CommandValidator {
    repo_root: PathBuf,
    policy: SandboxPolicy,
}

impl CommandValidator {
    pub fn new<P: Into<PathBuf>>(repo_root: P, policy: SandboxPolicy) -> Self {
        Self {
            repo_root: repo_root.into(),
            policy,
        }
    }
}

#[async_trait]
impl Validator for CommandValidator {
    async fn run_validations(&self, steps: &[ValidationStep]) -> ValidationRun {
        let started_at = now_ms();
        let mut results = Vec::new();
        let mut ok = true;
        for step in steps {
            let display = step.display();
            let command = match step.resolve() {
                Ok(command) => command,
                Err(rejection) => {
                    log::warn!("validation command rejected cmd={} reason={}", display, rejection);
                    results.push(CommandResult {
                        cmd: display,
                        ok: false,
                        out: String::new(),
                        err: BLOCKED_MESSAGE.to_string(),
                    });
                    ok = false;
                    break;
                }
            };
            let result = match execute_command(
                &self.policy,
                &self.repo_root,
                command.program.as_str(),
                &command.args,
                self.policy.validation_timeout_ms,
            )
            .await
            {
                Ok(execution) => CommandResult {
                    cmd: display,
                    ok: execution.success,
                    out: execution.stdout,
                    err: execution.stderr,
                },
                Err(err) => CommandResult {
                    cmd: display,
                    ok: false,
                    out: String::new(),
                    err: err.to_string(),
                },
            };
            let passed = result.ok;
            results.push(result);
            if !passed {
                ok = false;
                break;
            }
        }
        ValidationRun {
            ok,
            results,
            started_at,
            finished_at: now_ms(),
        }
    }

    async fn run_canary(&self) -> CanaryResult {
        let script = self.repo_root.join(&self.policy.canary_script);
        if !script.is_file() {
            return CanaryResult {
                ok: true,
                skipped: true,
                reason: Some("canary.js not found".to_string()),
                out: String::new(),
                err: String::new(),
            };
        }
        let args = vec![script.to_string_lossy().to_string()];
        match execute_command(
            &self.policy,
            &self.repo_root,
            "node",
            &args,
            self.policy.canary_timeout_ms,
        )
        .await
        {
            Ok(execution) => CanaryResult {
                ok: execution.success,
                skipped: false,
                reason: None,
                out: clip(&execution.stdout, 500),
                err: clip(&execution.stderr, 500),
            },
            Err(err) => CanaryResult {
                ok: false,
                skipped: false,
                reason: None,
                out: String::new(),
                err: clip(&err.to_string(), 500),
            },
        }
    }
}

fn truncate_to_limit(bytes: &[u8], max_bytes: usize) -> String {
    let truncated = if bytes.len() > max_bytes {
        &bytes[..max_bytes]
    } else {
        bytes
    };
    String::from_utf8_lossy(truncated).to_string()
}

fn io_err(err: std::io::Error) -> SandboxError {
    SandboxError::Io(err.to_string())
}
