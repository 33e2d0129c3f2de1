//! Policy configuration model and layered merging.
//!
//! [`PolicyConfig`] is the fully-resolved shape the engine evaluates.
//! [`PolicyLayer`] is what a policy file actually holds: every field optional,
//! plus `extends`, `imports` and named `profiles`. Layers are folded onto
//! [`PolicyConfig::default`] with [`PolicyConfig::merge`].

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

// ============================================================================
// Resolved config
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Block,
    Warn,
}

impl RuleAction {
    /// Anything other than `"block"` is a warning.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()) {
            Some(s) if s == "block" => RuleAction::Block,
            _ => RuleAction::Warn,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    pub pattern: String,
    pub action: RuleAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainPolicy {
    pub path_patterns: Vec<String>,
    pub override_allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_test_patterns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_patch_lines: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_multiplier: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyConfig {
    pub forbidden_patterns: Vec<String>,
    pub required_test_patterns: Vec<String>,
    pub risk_threshold: f64,
    pub large_patch_files: usize,
    pub large_patch_risk: f64,
    pub rules: Vec<PolicyRule>,
    pub domains: BTreeMap<String, DomainPolicy>,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for PolicyConfig {
    fn default() -> Self {
        let mut domains = BTreeMap::new();
        domains.insert(
            "auth".to_string(),
            DomainPolicy {
                path_patterns: strings(&["auth/**", "src/auth/**"]),
                override_allowed: false,
                required_test_patterns: Some(strings(&[
                    "**/auth/**/*.test.ts",
                    "**/auth/**/*.spec.ts",
                ])),
                max_patch_lines: None,
                risk_multiplier: Some(1.3),
            },
        );
        domains.insert(
            "infra".to_string(),
            DomainPolicy {
                path_patterns: strings(&["infra/**", ".github/workflows/**"]),
                override_allowed: true,
                required_test_patterns: Some(strings(&["**/*.test.ts", "**/*.spec.ts"])),
                max_patch_lines: None,
                risk_multiplier: Some(1.2),
            },
        );
        domains.insert(
            "migrations".to_string(),
            DomainPolicy {
                path_patterns: strings(&["migrations/**", "db/migrations/**"]),
                override_allowed: false,
                required_test_patterns: None,
                max_patch_lines: Some(20),
                risk_multiplier: Some(1.4),
            },
        );
        domains.insert(
            "ui".to_string(),
            DomainPolicy {
                path_patterns: strings(&["ui/**", "src/ui/**", "web/**"]),
                override_allowed: true,
                required_test_patterns: None,
                max_patch_lines: None,
                risk_multiplier: Some(0.9),
            },
        );

        Self {
            forbidden_patterns: strings(&[
                "package-lock.json",
                "yarn.lock",
                "pnpm-lock.yaml",
                ".env",
                ".env.*",
                "*.pem",
                "*.key",
                ".patch_policies.json",
                ".patch_custody_chain.jsonl",
                ".custody/**",
            ]),
            required_test_patterns: strings(&["**/*.test.ts", "**/*.spec.ts", "**/__tests__/**"]),
            risk_threshold: 70.0,
            large_patch_files: 8,
            large_patch_risk: 20.0,
            rules: vec![
                PolicyRule {
                    pattern: ".github/workflows/**".into(),
                    action: RuleAction::Warn,
                    reason: Some("CI workflow touched".into()),
                    risk: Some(15.0),
                },
                PolicyRule {
                    pattern: "package.json".into(),
                    action: RuleAction::Warn,
                    reason: Some("Dependencies/runtime config changed".into()),
                    risk: Some(10.0),
                },
            ],
            domains,
        }
    }
}

// ============================================================================
// Partial layers (policy file shape)
// ============================================================================

/// A path or a list of paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    /// Non-empty trimmed entries, in order.
    pub fn to_vec(&self) -> Vec<String> {
        let raw: Vec<&String> = match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v.iter().collect(),
        };
        raw.into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleLayer {
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub risk: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainLayer {
    #[serde(default)]
    pub path_patterns: Option<Vec<String>>,
    #[serde(default)]
    pub override_allowed: Option<bool>,
    #[serde(default)]
    pub required_test_patterns: Option<Vec<String>>,
    #[serde(default)]
    pub max_patch_lines: Option<f64>,
    #[serde(default)]
    pub risk_multiplier: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyLayer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forbidden_patterns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_test_patterns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub large_patch_files: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub large_patch_risk: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rules: Option<Vec<RuleLayer>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domains: Option<BTreeMap<String, DomainLayer>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<OneOrMany>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imports: Option<OneOrMany>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profiles: Option<BTreeMap<String, PolicyLayer>>,
}

impl PolicyLayer {
    /// Parse a policy file body. Blank input is an empty layer.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw)
    }

    /// A layer that only sets the threshold.
    pub fn threshold(value: f64) -> Self {
        Self {
            risk_threshold: Some(value),
            ..Self::default()
        }
    }

    pub fn extends_list(&self) -> Vec<String> {
        self.extends.as_ref().map(OneOrMany::to_vec).unwrap_or_default()
    }

    pub fn imports_list(&self) -> Vec<String> {
        self.imports.as_ref().map(OneOrMany::to_vec).unwrap_or_default()
    }

    /// Profile lookup is case-insensitive on the requested name.
    pub fn profile(&self, name: &str) -> Option<&PolicyLayer> {
        let wanted = name.trim().to_ascii_lowercase();
        self.profiles.as_ref()?.get(&wanted)
    }
}

// ============================================================================
// Merge
// ============================================================================

fn clean_patterns(patterns: &[String]) -> Vec<String> {
    patterns
        .iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Replace only when the incoming list has at least one usable pattern.
fn replace_patterns(target: &mut Vec<String>, incoming: Option<&Vec<String>>) {
    if let Some(list) = incoming {
        let cleaned = clean_patterns(list);
        if !cleaned.is_empty() {
            *target = cleaned;
        }
    }
}

fn finite(v: Option<f64>) -> Option<f64> {
    v.filter(|n| n.is_finite())
}

fn merge_domain(base: Option<&DomainPolicy>, next: &DomainLayer) -> DomainPolicy {
    let mut out = base.cloned().unwrap_or(DomainPolicy {
        path_patterns: Vec::new(),
        override_allowed: true,
        required_test_patterns: None,
        max_patch_lines: None,
        risk_multiplier: None,
    });

    replace_patterns(&mut out.path_patterns, next.path_patterns.as_ref());
    if let Some(allowed) = next.override_allowed {
        out.override_allowed = allowed;
    }
    if let Some(list) = &next.required_test_patterns {
        let cleaned = clean_patterns(list);
        if !cleaned.is_empty() {
            out.required_test_patterns = Some(cleaned);
        }
    }
    if let Some(max) = finite(next.max_patch_lines).filter(|n| *n > 0.0) {
        out.max_patch_lines = Some(max.ceil().max(1.0) as usize);
    }
    if let Some(m) = finite(next.risk_multiplier).filter(|n| *n >= 0.0) {
        out.risk_multiplier = Some(m);
    }
    out
}

impl PolicyConfig {
    /// Apply one layer on top of this config.
    ///
    /// Non-empty lists replace, domains merge field-wise by name, numbers
    /// replace with clamping. `extends`, `imports` and `profiles` are not
    /// followed here; see `policy::resolve`.
    pub fn merge(&self, layer: &PolicyLayer) -> PolicyConfig {
        let mut out = self.clone();

        replace_patterns(&mut out.forbidden_patterns, layer.forbidden_patterns.as_ref());
        replace_patterns(&mut out.required_test_patterns, layer.required_test_patterns.as_ref());

        if let Some(rules) = &layer.rules {
            let parsed: Vec<PolicyRule> = rules
                .iter()
                .filter_map(|r| {
                    let pattern = r.pattern.as_deref().unwrap_or_default().trim().to_string();
                    if pattern.is_empty() {
                        return None;
                    }
                    Some(PolicyRule {
                        pattern,
                        action: RuleAction::parse(r.action.as_deref()),
                        reason: r
                            .reason
                            .as_deref()
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(String::from),
                        risk: finite(r.risk),
                    })
                })
                .collect();
            if !parsed.is_empty() {
                out.rules = parsed;
            }
        }

        if let Some(domains) = &layer.domains {
            for (name, next) in domains {
                let merged = merge_domain(out.domains.get(name), next);
                if merged.path_patterns.is_empty() {
                    continue;
                }
                out.domains.insert(name.clone(), merged);
            }
        }

        if let Some(t) = finite(layer.risk_threshold) {
            out.risk_threshold = t.max(0.0);
        }
        if let Some(n) = finite(layer.large_patch_files) {
            out.large_patch_files = n.ceil().max(1.0) as usize;
        }
        if let Some(r) = finite(layer.large_patch_risk) {
            out.large_patch_risk = r.max(0.0);
        }
        out
    }
}

/// Starter policy file: the defaults plus `extends`, `imports` and the
/// `strict` / `balanced` / `experimental` profiles.
pub fn default_policy_template_json() -> String {
    let mut value = serde_json::to_value(PolicyConfig::default()).unwrap_or_else(|_| json!({}));
    if let Some(obj) = value.as_object_mut() {
        obj.insert("extends".into(), json!([]));
        obj.insert("imports".into(), json!([]));
        obj.insert(
            "profiles".into(),
            json!({
                "strict": { "riskThreshold": 60 },
                "balanced": { "riskThreshold": 70 },
                "experimental": { "riskThreshold": 85 },
            }),
        );
    }
    let mut out = serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string());
    out.push('\n');
    out
}
