//! Layered policy resolution from workspace files.
//!
//! Resolution order for one file node:
//!
//! ```text
//! defaults <- extends (each, parent then child) <- body <- imports (each)
//!          <- selected profile <- runtime threshold override
//! ```
//!
//! Every node is visited at most once per call. A revisit (cycle or diamond)
//! contributes nothing and is recorded as a diagnostic. Unreadable or invalid
//! nodes also contribute nothing; resolution always completes.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, warn};

use super::config::{PolicyConfig, PolicyLayer};
use crate::ports::{validate_relative_path, WorkspaceFs};

pub const DEFAULT_PROFILE: &str = "balanced";

#[derive(Debug, Clone, PartialEq)]
pub struct ResolveOptions {
    /// Profile name, matched lowercase against the file's `profiles`
    pub profile: String,
    /// Forces the final threshold regardless of what the files say
    pub risk_threshold_override: Option<f64>,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            profile: DEFAULT_PROFILE.to_string(),
            risk_threshold_override: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveIssue {
    Missing,
    Unreadable(String),
    InvalidJson(String),
    AlreadyVisited,
    RefusedPath,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveDiagnostic {
    pub path: String,
    pub issue: ResolveIssue,
}

impl std::fmt::Display for ResolveDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.issue {
            ResolveIssue::Missing => write!(f, "policy file {} not found", self.path),
            ResolveIssue::Unreadable(e) => write!(f, "policy file {} unreadable: {e}", self.path),
            ResolveIssue::InvalidJson(e) => write!(f, "policy file {} invalid: {e}", self.path),
            ResolveIssue::AlreadyVisited => {
                write!(f, "policy file {} already visited, skipped", self.path)
            }
            ResolveIssue::RefusedPath => write!(f, "policy path {} refused", self.path),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPolicy {
    pub config: PolicyConfig,
    /// Nodes that contributed, in visit order
    pub visited: Vec<String>,
    pub diagnostics: Vec<ResolveDiagnostic>,
}

struct Resolver<'a> {
    fs: &'a dyn WorkspaceFs,
    profile: String,
    seen: HashSet<String>,
    visited: Vec<String>,
    layers: Vec<PolicyLayer>,
    diagnostics: Vec<ResolveDiagnostic>,
}

impl<'a> Resolver<'a> {
    fn note(&mut self, path: &str, issue: ResolveIssue) {
        let diag = ResolveDiagnostic {
            path: path.to_string(),
            issue,
        };
        match diag.issue {
            ResolveIssue::Missing | ResolveIssue::AlreadyVisited => debug!("{diag}"),
            _ => warn!(path = %diag.path, "{diag}"),
        }
        self.diagnostics.push(diag);
    }

    fn collect(&mut self, raw: String) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let rel = raw.replace('\\', "/").trim().to_string();
            if rel.is_empty() {
                return;
            }
            if validate_relative_path(&rel).is_err() {
                self.note(&rel, ResolveIssue::RefusedPath);
                return;
            }
            if !self.seen.insert(rel.clone()) {
                self.note(&rel, ResolveIssue::AlreadyVisited);
                return;
            }

            let text = match self.fs.read_to_string(&rel).await {
                Ok(Some(text)) => text,
                Ok(None) => {
                    self.note(&rel, ResolveIssue::Missing);
                    return;
                }
                Err(e) => {
                    self.note(&rel, ResolveIssue::Unreadable(e.to_string()));
                    return;
                }
            };
            let layer = match PolicyLayer::from_json(&text) {
                Ok(layer) => layer,
                Err(e) => {
                    self.note(&rel, ResolveIssue::InvalidJson(e.to_string()));
                    return;
                }
            };
            self.visited.push(rel);

            for parent in layer.extends_list() {
                self.collect(parent).await;
            }
            let profile = layer.profile(&self.profile).cloned();
            let imports = layer.imports_list();
            self.layers.push(layer);
            for imported in imports {
                self.collect(imported).await;
            }
            if let Some(profile) = profile {
                self.layers.push(profile);
            }
        })
    }
}

/// Resolve the policy rooted at `path`. Never fails; see diagnostics.
pub async fn resolve_policy(fs: &dyn WorkspaceFs, path: &str, opts: &ResolveOptions) -> ResolvedPolicy {
    let profile = opts.profile.trim().to_ascii_lowercase();
    let mut resolver = Resolver {
        fs,
        profile: if profile.is_empty() {
            DEFAULT_PROFILE.to_string()
        } else {
            profile
        },
        seen: HashSet::new(),
        visited: Vec::new(),
        layers: Vec::new(),
        diagnostics: Vec::new(),
    };
    resolver.collect(path.to_string()).await;

    let mut config = resolver
        .layers
        .iter()
        .fold(PolicyConfig::default(), |acc, layer| acc.merge(layer));
    if let Some(threshold) = opts.risk_threshold_override {
        config = config.merge(&PolicyLayer::threshold(threshold));
    }

    debug!(
        nodes = resolver.visited.len(),
        diagnostics = resolver.diagnostics.len(),
        threshold = config.risk_threshold,
        "policy resolved"
    );

    ResolvedPolicy {
        config,
        visited: resolver.visited,
        diagnostics: resolver.diagnostics,
    }
}
