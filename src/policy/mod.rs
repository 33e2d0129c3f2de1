//! Risk policy: configuration, resolution, evaluation and trust scoring.

pub mod config;
pub mod engine;
pub mod glob;
pub mod resolve;
pub mod trust;

pub use config::{
    default_policy_template_json, DomainLayer, DomainPolicy, OneOrMany, PolicyConfig, PolicyLayer,
    PolicyRule, RuleAction, RuleLayer,
};
pub use engine::{
    evaluate_policy, match_domains, normalize_paths, BlockCause, PolicyEvaluationContext,
    PolicyVerdict, WarnMatch,
};
pub use glob::{Glob, GlobSet};
pub use resolve::{
    resolve_policy, ResolveDiagnostic, ResolveIssue, ResolveOptions, ResolvedPolicy,
    DEFAULT_PROFILE,
};
pub use trust::{
    compute_domain_trust_score, min_trust_for_domains, trust_by_domain, DomainHistoryMetrics,
    NEUTRAL_TRUST,
};
