//! Consistency auditor
//!
//! Compares the decision taken on a base world with the decisions taken on
//! its perturbed siblings. A divergent sibling gets a bias label from an
//! explicit first-match rule table keyed on the changed variable's profile
//! and the direction the decision moved.

use crate::catalog::{RiskEffect, VariableCatalog, VariableCategory, VariableProfile};
use crate::error::WhatIfError;
use crate::ledger::DecisionLedger;
use crate::perturbation::Perturbation;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use worldline_state::{AttributePath, Version};

/// Bias labels a divergence can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bias {
    Anchoring,
    Recency,
    EscalationCommitment,
    MirrorImaging,
    AvailabilityHeuristic,
    None,
}

impl fmt::Display for Bias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Anchoring => "anchoring",
            Self::Recency => "recency",
            Self::EscalationCommitment => "escalation_commitment",
            Self::MirrorImaging => "mirror_imaging",
            Self::AvailabilityHeuristic => "availability_heuristic",
            Self::None => "none",
        };
        f.write_str(s)
    }
}

/// Direction of a changed decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Shift {
    /// Sibling option ranks more aggressive
    Escalated,
    /// Sibling option ranks less aggressive
    DeEscalated,
    /// Different option, same rank
    Lateral,
}

impl fmt::Display for Shift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Escalated => "escalated",
            Self::DeEscalated => "de_escalated",
            Self::Lateral => "lateral",
        };
        f.write_str(s)
    }
}

/// Aggressiveness rank per option; higher is more aggressive
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptionRanking {
    ranks: IndexMap<String, u32>,
}

impl OptionRanking {
    /// Rank options by position, least aggressive first
    #[must_use]
    pub fn ordered<I, S>(options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ranks = options
            .into_iter()
            .zip(0u32..)
            .map(|(option, rank)| (option.into(), rank))
            .collect();
        Self { ranks }
    }

    /// With an explicit rank
    #[must_use]
    pub fn with_rank(mut self, option: impl Into<String>, rank: u32) -> Self {
        self.ranks.insert(option.into(), rank);
        self
    }

    /// Rank of `option`
    #[must_use]
    pub fn rank(&self, option: &str) -> Option<u32> {
        self.ranks.get(option).copied()
    }

    /// Direction from `base` to `sibling`
    ///
    /// # Errors
    /// Returns `WhatIfError::UnrankedOption` if either option is unranked
    pub fn shift(&self, base: &str, sibling: &str) -> Result<Shift, WhatIfError> {
        let rank = |o: &str| self.rank(o).ok_or_else(|| WhatIfError::UnrankedOption(o.to_string()));
        let (from, to) = (rank(base)?, rank(sibling)?);
        Ok(match to.cmp(&from) {
            std::cmp::Ordering::Greater => Shift::Escalated,
            std::cmp::Ordering::Less => Shift::DeEscalated,
            std::cmp::Ordering::Equal => Shift::Lateral,
        })
    }
}

/// One row of the rule table; `None` and empty lists match anything
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<VariableCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskEffect>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shifts: Vec<Shift>,
    pub bias: Bias,
}

impl Rule {
    /// Row matching anything
    #[must_use]
    pub fn any(bias: Bias) -> Self {
        Self {
            category: None,
            risk: None,
            shifts: Vec::new(),
            bias,
        }
    }

    /// Restrict to a category
    #[must_use]
    pub fn category(mut self, category: VariableCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// Restrict to a risk effect
    #[must_use]
    pub fn risk(mut self, risk: RiskEffect) -> Self {
        self.risk = Some(risk);
        self
    }

    /// Restrict to these shifts
    #[must_use]
    pub fn shifts(mut self, shifts: impl IntoIterator<Item = Shift>) -> Self {
        self.shifts = shifts.into_iter().collect();
        self
    }

    /// Check a divergence against this row
    #[must_use]
    pub fn matches(&self, profile: VariableProfile, shift: Shift) -> bool {
        self.category.map_or(true, |c| c == profile.category)
            && self.risk.map_or(true, |r| r == profile.risk)
            && (self.shifts.is_empty() || self.shifts.contains(&shift))
    }
}

/// Ordered, first-match rule table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTable {
    #[serde(rename = "rule")]
    rules: Vec<Rule>,
}

impl Default for RuleTable {
    fn default() -> Self {
        use Shift::{Escalated, Lateral};
        Self::new(vec![
            Rule::any(Bias::EscalationCommitment)
                .risk(RiskEffect::Increases)
                .shifts([Escalated, Lateral]),
            Rule::any(Bias::EscalationCommitment)
                .category(VariableCategory::Commitment)
                .shifts([Escalated, Lateral]),
            Rule::any(Bias::MirrorImaging).category(VariableCategory::Adversary),
            Rule::any(Bias::Anchoring).category(VariableCategory::Anchor),
            Rule::any(Bias::Recency).category(VariableCategory::Recent),
            Rule::any(Bias::AvailabilityHeuristic).category(VariableCategory::Salient),
            Rule::any(Bias::AvailabilityHeuristic).risk(RiskEffect::Neutral),
            Rule::any(Bias::None),
        ])
    }
}

impl RuleTable {
    /// Table from explicit rows
    #[inline]
    #[must_use]
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    /// Rows in evaluation order
    #[inline]
    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// First matching row (1-based) and its label; `None` bias if nothing matches
    #[must_use]
    pub fn classify(&self, profile: VariableProfile, shift: Shift) -> (Option<usize>, Bias) {
        self.rules
            .iter()
            .position(|r| r.matches(profile, shift))
            .map_or((None, Bias::None), |idx| (Some(idx + 1), self.rules[idx].bias))
    }

    /// Parse `[[rule]]` tables
    ///
    /// # Errors
    /// Returns `WhatIfError::Config` on a parse failure or an empty table
    pub fn from_toml_str(s: &str) -> Result<Self, WhatIfError> {
        let table: Self = toml::from_str(s).map_err(|e| WhatIfError::Config(e.to_string()))?;
        if table.rules.is_empty() {
            return Err(WhatIfError::Config("rule table is empty".into()));
        }
        Ok(table)
    }
}

impl fmt::Display for RuleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>2}  {:<11} {:<10} {:<26} label", "#", "category", "risk", "shift")?;
        for (idx, rule) in self.rules.iter().enumerate() {
            let category = rule.category.map_or_else(|| "*".to_string(), |c| c.to_string());
            let risk = rule.risk.map_or_else(|| "*".to_string(), |r| r.to_string());
            let shifts = if rule.shifts.is_empty() {
                "*".to_string()
            } else {
                rule.shifts
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            writeln!(
                f,
                "{:>2}  {category:<11} {risk:<10} {shifts:<26} {}",
                idx + 1,
                rule.bias
            )?;
        }
        Ok(())
    }
}

/// How many siblings have a decision yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    /// No sibling decisions (or no base decision) yet
    Pending,
    /// Some siblings decided
    Partial,
    /// Every sibling decided
    Complete,
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Partial => "partial",
            Self::Complete => "complete",
        };
        f.write_str(s)
    }
}

/// Comparison of one sibling's decision with the base decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub derived_version: Version,
    pub changed_variable: AttributePath,
    pub sibling_option: String,
    pub divergence: bool,
    /// Set only when divergent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shift: Option<Shift>,
    pub bias: Bias,
    /// 1-based rule that produced the label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<usize>,
}

/// Audit output for one decision point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub decision_point: String,
    pub base_version: Version,
    pub base_option: Option<String>,
    pub status: AuditStatus,
    pub findings: Vec<Finding>,
    /// Siblings still waiting for a decision
    pub awaiting: Vec<Version>,
}

impl AuditReport {
    /// Finding for one sibling
    #[must_use]
    pub fn finding(&self, derived: Version) -> Option<&Finding> {
        self.findings.iter().find(|f| f.derived_version == derived)
    }

    /// Divergent findings only
    pub fn divergent(&self) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(|f| f.divergence)
    }
}

impl fmt::Display for AuditReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at {}: {}",
            self.decision_point, self.base_version, self.status
        )?;
        if let Some(option) = &self.base_option {
            write!(f, " (base chose {option})")?;
        }
        writeln!(f)?;
        for finding in &self.findings {
            write!(
                f,
                "  {} {} -> {}",
                finding.derived_version, finding.changed_variable, finding.sibling_option
            )?;
            match (finding.shift, finding.rule) {
                (Some(shift), Some(rule)) => {
                    writeln!(f, " [{shift}] {} (rule {rule})", finding.bias)?;
                }
                (Some(shift), None) => writeln!(f, " [{shift}] {}", finding.bias)?,
                _ => writeln!(f, " consistent")?,
            }
        }
        for version in &self.awaiting {
            writeln!(f, "  {version} awaiting decision")?;
        }
        Ok(())
    }
}

/// Applies the rule table to recorded decisions
#[derive(Debug, Clone)]
pub struct ConsistencyAuditor {
    ranking: OptionRanking,
    rules: RuleTable,
}

impl ConsistencyAuditor {
    /// Create new auditor with the default rule table
    #[inline]
    #[must_use]
    pub fn new(ranking: OptionRanking) -> Self {
        Self {
            ranking,
            rules: RuleTable::default(),
        }
    }

    /// Replace the rule table
    #[inline]
    #[must_use]
    pub fn with_rules(mut self, rules: RuleTable) -> Self {
        self.rules = rules;
        self
    }

    /// Active rule table
    #[inline]
    #[must_use]
    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// Audit `decision_point` at `base` across the given siblings
    ///
    /// Siblings of other bases or decision points are ignored.
    ///
    /// # Errors
    /// Returns `WhatIfError::UnrankedOption` if a divergent option has no rank
    #[tracing::instrument(skip(self, perturbations, catalog, ledger), fields(siblings = perturbations.len()))]
    pub fn audit(
        &self,
        base: Version,
        decision_point: &str,
        perturbations: &[Perturbation],
        catalog: &VariableCatalog,
        ledger: &DecisionLedger,
    ) -> Result<AuditReport, WhatIfError> {
        let siblings: Vec<&Perturbation> = perturbations
            .iter()
            .filter(|p| p.base_version == base && p.decision_point == decision_point)
            .collect();
        let base_decision = ledger.get(base, decision_point);

        let mut report = AuditReport {
            decision_point: decision_point.to_string(),
            base_version: base,
            base_option: base_decision.as_ref().map(|d| d.chosen_option.clone()),
            status: AuditStatus::Pending,
            findings: Vec::new(),
            awaiting: Vec::new(),
        };
        let Some(base_decision) = base_decision else {
            report.awaiting = siblings.iter().map(|p| p.derived_version).collect();
            tracing::debug!("no base decision yet");
            return Ok(report);
        };

        for sibling in siblings {
            let Some(decision) = ledger.get(sibling.derived_version, decision_point) else {
                report.awaiting.push(sibling.derived_version);
                continue;
            };
            let divergence = decision.chosen_option != base_decision.chosen_option;
            let (shift, rule, bias) = if divergence {
                let shift = self
                    .ranking
                    .shift(&base_decision.chosen_option, &decision.chosen_option)?;
                let profile = catalog.profile(&sibling.changed_variable);
                let (rule, bias) = self.rules.classify(profile, shift);
                (Some(shift), rule, bias)
            } else {
                (None, None, Bias::None)
            };
            report.findings.push(Finding {
                derived_version: sibling.derived_version,
                changed_variable: sibling.changed_variable.clone(),
                sibling_option: decision.chosen_option.clone(),
                divergence,
                shift,
                bias,
                rule,
            });
        }

        report.status = match (report.findings.len(), report.awaiting.len()) {
            (0, _) => AuditStatus::Pending,
            (_, 0) => AuditStatus::Complete,
            _ => AuditStatus::Partial,
        };
        tracing::info!(
            status = ?report.status,
            divergent = report.divergent().count(),
            "audit finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::{RiskEffect::*, Shift::*, VariableCategory::*};

    fn p(category: VariableCategory, risk: RiskEffect) -> VariableProfile {
        VariableProfile::new(category, risk)
    }

    #[test]
    fn default_table_rows() {
        let t = RuleTable::default();
        assert_eq!(t.rules().len(), 8);
        assert_eq!(t.classify(p(Other, Increases), Escalated), (Some(1), Bias::EscalationCommitment));
        assert_eq!(t.classify(p(Other, Increases), Lateral), (Some(1), Bias::EscalationCommitment));
        assert_eq!(t.classify(p(Commitment, Decreases), Escalated), (Some(2), Bias::EscalationCommitment));
        assert_eq!(t.classify(p(Adversary, Increases), DeEscalated), (Some(3), Bias::MirrorImaging));
        assert_eq!(t.classify(p(Anchor, Decreases), DeEscalated), (Some(4), Bias::Anchoring));
        assert_eq!(t.classify(p(Recent, Decreases), Escalated), (Some(5), Bias::Recency));
        assert_eq!(t.classify(p(Salient, Increases), DeEscalated), (Some(6), Bias::AvailabilityHeuristic));
        assert_eq!(t.classify(p(Other, Neutral), DeEscalated), (Some(7), Bias::AvailabilityHeuristic));
        assert_eq!(t.classify(p(Other, Decreases), Escalated), (Some(8), Bias::None));
    }

    #[test]
    fn empty_custom_table_labels_none() {
        let t = RuleTable::new(vec![Rule::any(Bias::Recency).category(Recent)]);
        assert_eq!(t.classify(p(Other, Neutral), Lateral), (None, Bias::None));
    }

    #[test]
    fn table_from_toml() {
        let t = RuleTable::from_toml_str(
            r#"
            [[rule]]
            risk = "increases"
            shifts = ["escalated"]
            bias = "escalation_commitment"

            [[rule]]
            bias = "none"
            "#,
        )
        .unwrap();
        assert_eq!(t.classify(p(Other, Increases), Escalated).1, Bias::EscalationCommitment);
        assert_eq!(t.classify(p(Other, Increases), Lateral), (Some(2), Bias::None));
        assert!(RuleTable::from_toml_str("rule = []").is_err());
    }

    #[test]
    fn table_renders_every_row() {
        let text = RuleTable::default().to_string();
        assert_eq!(text.lines().count(), 9);
        assert!(text.contains("escalated, lateral"));
        assert!(text.contains("mirror_imaging"));
    }

    #[test]
    fn ranking_shifts() {
        let r = OptionRanking::ordered(["hold", "deliberate", "aggressive"]);
        assert_eq!(r.shift("deliberate", "aggressive").unwrap(), Escalated);
        assert_eq!(r.shift("aggressive", "hold").unwrap(), DeEscalated);
        let r = r.with_rank("feint", 2);
        assert_eq!(r.shift("aggressive", "feint").unwrap(), Lateral);
        assert!(matches!(
            r.shift("aggressive", "surrender"),
            Err(WhatIfError::UnrankedOption(o)) if o == "surrender"
        ));
    }
}
