//! Static source validation
//!
//! Cheap checks run before a submission may take a scheduler slot. The
//! denylist is a pre-filter only; isolation is the runner's job.

use std::sync::Arc;

use regex::Regex;

use crate::core::languages::{DenyRule, LanguageProfile, LanguageRegistry};
use crate::error::RejectReason;

/// Default ceiling on submitted source size (100 KB)
pub const DEFAULT_MAX_SOURCE_BYTES: usize = 100_000;

const COMMON_RULES: &[(&str, &str)] = &[
    (r"\beval\s*\(", "dynamic code evaluation"),
    // Free calls only: `re.exec(`, `Foo::exec(` and `$db->exec(` are methods
    (
        r"(?m)(?:^|[^.\w:>$])exec(?:l|lp|le|v|vp|vpe|ve)?\s*\(",
        "process replacement or dynamic execution",
    ),
    (r"\bsystem\s*\(", "shell command execution"),
    (
        r"\b(?:popen|fork|vfork|posix_spawn|shell_exec|passthru|proc_open)\s*\(",
        "process spawning",
    ),
    (r"\bsocket\s*\(", "raw socket access"),
];

const LOOP_SHAPES: &[&str] = &[
    r"while\s*\(\s*(?:true|1)\s*\)",
    r"(?m)\bwhile\s+(?:True|true|1)\s*(?::|;|\bdo\b|$)",
    r"for\s*\(\s*;\s*;\s*\)",
    r"\bloop\s*\{",
    r"\bfor\s*\{",
];

const LOOP_EXITS: &str = r"\b(?:break|return|exit|raise|throw|goto)\b";

pub struct StaticValidator {
    registry: Arc<LanguageRegistry>,
    max_source_bytes: usize,
    common_rules: Vec<DenyRule>,
    loop_shapes: Vec<Regex>,
    loop_exits: Regex,
}

impl StaticValidator {
    pub fn new(registry: Arc<LanguageRegistry>, max_source_bytes: usize) -> Self {
        // Patterns are compile-time constants
        let common_rules = COMMON_RULES
            .iter()
            .map(|(pattern, reason)| DenyRule {
                pattern: Regex::new(pattern).expect("valid common deny pattern"),
                reason: (*reason).to_string(),
            })
            .collect();
        let loop_shapes = LOOP_SHAPES
            .iter()
            .map(|pattern| Regex::new(pattern).expect("valid loop pattern"))
            .collect();

        Self {
            registry,
            max_source_bytes,
            common_rules,
            loop_shapes,
            loop_exits: Regex::new(LOOP_EXITS).expect("valid loop exit pattern"),
        }
    }

    /// Check a submission; the first violation wins
    pub fn validate(&self, source_code: &str, language: &str) -> Result<(), RejectReason> {
        let profile =
            self.registry
                .get(language)
                .ok_or_else(|| RejectReason::UnsupportedLanguage {
                    language: language.to_string(),
                })?;
        self.validate_for(source_code, &profile)
    }

    /// Same checks against an already resolved profile
    pub fn validate_for(
        &self,
        source_code: &str,
        profile: &LanguageProfile,
    ) -> Result<(), RejectReason> {
        if source_code.trim().is_empty() {
            return Err(RejectReason::EmptySource);
        }

        if source_code.len() > self.max_source_bytes {
            return Err(RejectReason::PayloadTooLarge {
                what: "source code",
                size: source_code.len(),
                limit: self.max_source_bytes,
            });
        }

        let common: &[DenyRule] = if profile.security_tier.applies_common_rules() {
            &self.common_rules
        } else {
            &[]
        };
        if let Some(rule) = profile
            .deny_rules
            .iter()
            .chain(common.iter())
            .find(|rule| rule.pattern.is_match(source_code))
        {
            return Err(RejectReason::UnsafeConstruct {
                reason: rule.reason.clone(),
            });
        }

        if self.has_unbounded_loop(source_code) {
            return Err(RejectReason::PossibleInfiniteLoop);
        }

        Ok(())
    }

    /// An always-true loop with no exit keyword anywhere after it
    fn has_unbounded_loop(&self, source_code: &str) -> bool {
        self.loop_shapes.iter().any(|shape| {
            shape
                .find_iter(source_code)
                .any(|m| !self.loop_exits.is_match(&source_code[m.end()..]))
        })
    }
}
