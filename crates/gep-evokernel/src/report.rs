use gep_evolution::{
    clip, env_fingerprint_key, next_id, now_iso, AssetKind, ContentAddressed, EnvFingerprint,
    EvolutionError, ValidationCommandReport, ValidationReport, SCHEMA_VERSION,
};
use gep_sandbox::ValidationRun;
use serde_json::Value;

const REPORT_OUTPUT_LIMIT: usize = 4000;

/// Machine-readable record of one validation run, content-addressed.
pub fn build_validation_report(
    gene_id: Option<&str>,
    run: &ValidationRun,
    env: &EnvFingerprint,
) -> Result<ValidationReport, EvolutionError> {
    let commands = run
        .results
        .iter()
        .map(|result| ValidationCommandReport {
            command: result.cmd.clone(),
            ok: result.ok,
            stdout: clip(&result.out, REPORT_OUTPUT_LIMIT),
            stderr: clip(&result.err, REPORT_OUTPUT_LIMIT),
        })
        .collect::<Vec<_>>();
    let overall_ok = !commands.is_empty() && commands.iter().all(|command| command.ok);
    let duration_ms = (run.finished_at >= run.started_at)
        .then(|| u64::try_from(run.finished_at - run.started_at).ok())
        .flatten();

    let mut report = ValidationReport {
        kind: AssetKind::ValidationReport,
        schema_version: SCHEMA_VERSION.to_string(),
        id: next_id("vr"),
        gene_id: gene_id.map(str::to_string),
        env_fingerprint: Some(env.clone()),
        env_fingerprint_key: Some(env_fingerprint_key(env)),
        commands,
        overall_ok,
        duration_ms,
        created_at: now_iso(),
        asset_id: None,
    };
    report.seal()?;
    Ok(report)
}

/// Shape check for a report read back from the event log.
pub fn is_valid_validation_report(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some("ValidationReport")
        && value
            .get("id")
            .and_then(Value::as_str)
            .map_or(false, |id| !id.is_empty())
        && value.get("commands").map_or(false, Value::is_array)
        && value.get("overall_ok").map_or(false, Value::is_boolean)
}
