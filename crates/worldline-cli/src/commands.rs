//! Subcommand implementations, kept free of argument parsing

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use worldline_state::{EntryKind, JsonLinesSink, TurnLog, Version};
use worldline_whatif::{
    AuditReport, ConsistencyAuditor, DecisionLedger, DecisionRecord, OptionRanking, Perturbation,
    PerturbationEngine, ReplayEngine, RuleTable, VariableCatalog, WhatIfConfig,
};

/// Result of `verify`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct VerifySummary {
    pub(crate) versions: usize,
    pub(crate) head: Version,
    pub(crate) branches: usize,
    pub(crate) hashed: usize,
}

impl fmt::Display for VerifySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ok: {} versions, head {}, {} branches, {} hashes checked",
            self.versions, self.head, self.branches, self.hashed
        )
    }
}

/// Structural check, then a full replay with hash checks
pub(crate) fn verify(log_path: &Path) -> Result<VerifySummary> {
    let log = TurnLog::read_jsonl(log_path)
        .with_context(|| format!("reading {}", log_path.display()))?;
    log.verify()?;
    let replay = ReplayEngine::replay(log.entries())?;
    let entries = log.entries();
    Ok(VerifySummary {
        versions: entries.len(),
        head: replay.store().head(),
        branches: entries
            .iter()
            .filter(|e| e.kind == EntryKind::Branch)
            .count(),
        hashed: entries.iter().filter(|e| e.state_hash.is_some()).count(),
    })
}

/// Rebuild a store from `log_path`, optionally writing a fresh log to `out`
pub(crate) fn replay(log_path: &Path, out: Option<&Path>) -> Result<ReplayEngine> {
    let log = TurnLog::read_jsonl(log_path)
        .with_context(|| format!("reading {}", log_path.display()))?;
    let engine = match out {
        Some(out) => {
            if out.exists() {
                bail!("refusing to append to existing log {}", out.display());
            }
            let sink = JsonLinesSink::open(out)?;
            ReplayEngine::replay_to(log.entries(), Arc::new(sink))?
        }
        None => ReplayEngine::replay(log.entries())?,
    };
    Ok(engine)
}

/// Rebuild from `log_path` and append every later write to the same file
pub(crate) fn extend(log_path: &Path) -> Result<ReplayEngine> {
    let log = TurnLog::read_jsonl(log_path)
        .with_context(|| format!("reading {}", log_path.display()))?;
    let sink = JsonLinesSink::open(log_path)?;
    Ok(ReplayEngine::resume(log.entries(), Arc::new(sink))?)
}

/// One line per version: number, parent, kind, author, hash
pub(crate) fn history(engine: &ReplayEngine) -> Result<String> {
    let store = engine.store();
    let mut out = String::new();
    for entry in store.log().entries() {
        let parent = entry
            .parent_version
            .map_or_else(|| "-".to_string(), |p| p.to_string());
        let kind = match entry.kind {
            EntryKind::Genesis => "genesis",
            EntryKind::Linear => "linear",
            EntryKind::Branch => "branch",
        };
        let hash = store.get(entry.version)?.state_hash()?;
        out.push_str(&format!(
            "{:<5} <- {:<5} {:<8} {:<24} {}\n",
            entry.version.to_string(),
            parent,
            kind,
            entry.delta.author.as_deref().unwrap_or("-"),
            hash.short()
        ));
    }
    Ok(out)
}

/// Enveloped JSON snapshot at `version` (head if `None`)
pub(crate) fn inspect(engine: &ReplayEngine, version: Option<Version>) -> Result<String> {
    let version = version.unwrap_or_else(|| engine.store().head());
    let state = engine.at(version)?;
    Ok(serde_json::to_string_pretty(&state.envelope())?)
}

/// Generate sibling branches of `base` from a catalog file
pub(crate) fn what_if(
    engine: &ReplayEngine,
    base: Option<Version>,
    decision_point: &str,
    catalog_path: &Path,
    config: WhatIfConfig,
) -> Result<Vec<Perturbation>> {
    let catalog = load_catalog(catalog_path)?;
    let base = base.unwrap_or_else(|| engine.store().head());
    let siblings = PerturbationEngine::with_config(Arc::clone(engine.store()), config)
        .perturb(base, decision_point, &catalog)?;
    if siblings.is_empty() {
        tracing::warn!(%base, "no catalog variable is perturbable at this base");
    }
    Ok(siblings)
}

/// Inputs for `audit`
#[derive(Debug)]
pub(crate) struct AuditInput<'a> {
    pub(crate) base: Version,
    pub(crate) decision_point: &'a str,
    pub(crate) perturbations: &'a Path,
    pub(crate) decisions: &'a Path,
    pub(crate) ranking: OptionRanking,
    pub(crate) catalog: Option<&'a Path>,
    pub(crate) rules: Option<&'a Path>,
}

/// Audit recorded decisions against previously generated siblings
pub(crate) fn audit(input: &AuditInput<'_>) -> Result<AuditReport> {
    let text = read(input.perturbations)?;
    let perturbations: Vec<Perturbation> = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", input.perturbations.display()))?;

    let ledger = DecisionLedger::new();
    for (idx, line) in read(input.decisions)?.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: DecisionRecord = serde_json::from_str(line)
            .with_context(|| format!("{} line {}", input.decisions.display(), idx + 1))?;
        ledger.record(record)?;
    }

    let catalog = match input.catalog {
        Some(path) => load_catalog(path)?,
        None => VariableCatalog::new(),
    };
    let rules = match input.rules {
        Some(path) => RuleTable::from_toml_str(&read(path)?)?,
        None => RuleTable::default(),
    };
    let report = ConsistencyAuditor::new(input.ranking.clone())
        .with_rules(rules)
        .audit(
            input.base,
            input.decision_point,
            &perturbations,
            &catalog,
            &ledger,
        )?;
    Ok(report)
}

fn load_catalog(path: &Path) -> Result<VariableCatalog> {
    VariableCatalog::from_toml_str(&read(path)?)
        .with_context(|| format!("parsing catalog {}", path.display()))
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use worldline_state::{Delta, WorldStore};
    use worldline_test_utils::scenario_genesis;
    use worldline_whatif::{AuditStatus, Bias};

    fn recorded_log(dir: &Path) -> std::path::PathBuf {
        let file = dir.join("turns.jsonl");
        let store = WorldStore::builder()
            .genesis(scenario_genesis())
            .sink(Arc::new(JsonLinesSink::open(&file).unwrap()))
            .build()
            .unwrap();
        store
            .commit(
                Version(0),
                &Delta::builder()
                    .author("observe")
                    .set("adversary", "intent", "probe")
                    .build(),
            )
            .unwrap();
        store
            .branch(
                Version(0),
                &Delta::builder().set("strait", "mined", true).build(),
            )
            .unwrap();
        file
    }

    fn write(dir: &Path, name: &str, text: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::File::create(&path)
            .unwrap()
            .write_all(text.as_bytes())
            .unwrap();
        path
    }

    #[test]
    fn verify_counts_versions() {
        let dir = tempfile::tempdir().unwrap();
        let summary = verify(&recorded_log(dir.path())).unwrap();
        assert_eq!(
            summary,
            VerifySummary {
                versions: 3,
                head: Version(1),
                branches: 1,
                hashed: 3,
            }
        );
        assert!(summary.to_string().starts_with("ok: 3 versions"));
    }

    #[test]
    fn verify_rejects_truncated_history() {
        let dir = tempfile::tempdir().unwrap();
        let log = recorded_log(dir.path());
        let text = std::fs::read_to_string(&log).unwrap();
        let tail: Vec<&str> = text.lines().skip(1).collect();
        let broken = write(dir.path(), "broken.jsonl", &tail.join("\n"));
        assert!(verify(&broken).is_err());
    }

    #[test]
    fn replay_writes_fresh_log_once() {
        let dir = tempfile::tempdir().unwrap();
        let log = recorded_log(dir.path());
        let out = dir.path().join("copy.jsonl");
        let engine = replay(&log, Some(&out)).unwrap();
        assert_eq!(verify(&out).unwrap().versions, 3);
        assert!(replay(&log, Some(&out)).is_err());

        let listing = history(&engine).unwrap();
        assert_eq!(listing.lines().count(), 3);
        assert!(listing.lines().nth(1).unwrap().contains("observe"));
    }

    #[test]
    fn inspect_wraps_snapshot_in_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let engine = replay(&recorded_log(dir.path()), None).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&inspect(&engine, Some(Version(2))).unwrap()).unwrap();
        assert_eq!(json["synthetic"], serde_json::json!(true));
        assert!(inspect(&engine, Some(Version(9))).is_err());
    }

    #[test]
    fn what_if_siblings_are_appended_to_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = recorded_log(dir.path());
        let catalog = write(
            dir.path(),
            "catalog.toml",
            r#"
            [[variable]]
            path = "weather"
            alternates = ["storm"]

            [[variable]]
            path = "strait.mined"
            alternates = [true]
            "#,
        );
        let config = WhatIfConfig::new().with_k(2).with_seed(5);

        let engine = extend(&log).unwrap();
        let first = what_if(&engine, None, "dp-1", &catalog, config.clone()).unwrap();
        let mut derived: Vec<Version> = first.iter().map(|p| p.derived_version).collect();
        derived.sort();
        assert_eq!(derived, [Version(3), Version(4)]);

        let summary = verify(&log).unwrap();
        assert_eq!(summary.versions, 5);
        assert_eq!(summary.branches, 3);
        assert_eq!(summary.head, Version(1));
        let engine = replay(&log, None).unwrap();
        for p in &first {
            let json: serde_json::Value =
                serde_json::from_str(&inspect(&engine, Some(p.derived_version)).unwrap()).unwrap();
            assert_eq!(json["state"]["parent_version"], serde_json::json!(1));
        }

        let engine = extend(&log).unwrap();
        let second = what_if(&engine, None, "dp-2", &catalog, config).unwrap();
        assert!(second.iter().all(|p| p.derived_version >= Version(5)));
        assert_eq!(verify(&log).unwrap().versions, 7);
    }

    #[test]
    fn what_if_then_audit() {
        let dir = tempfile::tempdir().unwrap();
        let engine = replay(&recorded_log(dir.path()), None).unwrap();
        let catalog = write(
            dir.path(),
            "catalog.toml",
            r#"
            [[variable]]
            path = "weather"
            alternates = ["storm"]
            category = "salient"
            risk = "increases"

            [[variable]]
            path = "readiness"
            alternates = ["degraded"]
            "#,
        );
        let siblings = what_if(
            &engine,
            Some(Version(1)),
            "dp-1",
            &catalog,
            WhatIfConfig::new().with_k(2).with_seed(3),
        )
        .unwrap();
        assert_eq!(siblings.len(), 2);
        assert_eq!(engine.store().head(), Version(1));

        let perturbations = write(
            dir.path(),
            "siblings.json",
            &serde_json::to_string(&siblings).unwrap(),
        );
        let storm = siblings
            .iter()
            .find(|p| p.new_value == serde_json::json!("storm"))
            .unwrap();
        let decisions: Vec<String> = [
            (Version(1), "deliberate"),
            (storm.derived_version, "aggressive"),
        ]
        .iter()
        .map(|(v, option)| {
            serde_json::to_string(&DecisionRecord::new(*v, "dp-1", *option, "")).unwrap()
        })
        .collect();
        let decisions = write(dir.path(), "decisions.jsonl", &decisions.join("\n"));

        let report = audit(&AuditInput {
            base: Version(1),
            decision_point: "dp-1",
            perturbations: &perturbations,
            decisions: &decisions,
            ranking: OptionRanking::ordered(["hold", "deliberate", "aggressive"]),
            catalog: Some(&catalog),
            rules: None,
        })
        .unwrap();
        assert_eq!(report.status, AuditStatus::Partial);
        assert_eq!(report.findings[0].bias, Bias::EscalationCommitment);
        assert!(report.to_string().contains("rule 1"));
    }
}
