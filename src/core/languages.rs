//! Language registry for compilation and execution
//!
//! Profiles are loaded once (from the bundled `files/languages.toml` or an
//! override file) and never mutated afterwards, so lookups need no locking.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// How much the runtime and the validator trust a language's toolchain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityTier {
    /// Only the language's own deny rules apply
    Low,
    /// Language rules plus the common process/eval rules
    #[default]
    Medium,
    /// Like medium, and the run step may not create files
    High,
}

impl SecurityTier {
    pub fn applies_common_rules(self) -> bool {
        matches!(self, SecurityTier::Medium | SecurityTier::High)
    }
}

/// A denylisted source construct
#[derive(Debug, Clone)]
pub struct DenyRule {
    pub pattern: Regex,
    pub reason: String,
}

impl DenyRule {
    pub fn new(pattern: &str, reason: impl Into<String>) -> Result<Self> {
        let pattern =
            Regex::new(pattern).with_context(|| format!("Invalid deny pattern: {}", pattern))?;
        Ok(Self {
            pattern,
            reason: reason.into(),
        })
    }
}

/// Configuration for a supported programming language
#[derive(Debug, Clone)]
pub struct LanguageProfile {
    /// Canonical language id (e.g., "python")
    pub id: String,
    pub display_name: String,
    /// Name of the source file (e.g., "main.cpp")
    pub source_file: String,
    /// Compile command (None for interpreted languages)
    pub compile_command: Option<Vec<String>>,
    /// Run command
    pub run_command: Vec<String>,
    /// Hard wall-clock limit for the run step
    pub timeout_ms: u64,
    /// Resident memory ceiling for the run step
    pub memory_limit_bytes: u64,
    pub security_tier: SecurityTier,
    /// Whether RLIMIT_AS may be applied (false for runtimes that reserve
    /// large virtual ranges up front, e.g. the JVM)
    pub limit_address_space: bool,
    pub aliases: Vec<String>,
    pub deny_rules: Vec<DenyRule>,
}

impl LanguageProfile {
    pub fn needs_compile(&self) -> bool {
        self.compile_command.is_some()
    }

    /// Extension of the source file, including the leading dot
    pub fn file_extension(&self) -> &str {
        match self.source_file.rfind('.') {
            Some(idx) => &self.source_file[idx..],
            None => "",
        }
    }

    pub fn summary(&self) -> LanguageSummary {
        LanguageSummary {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
            file_extension: self.file_extension().to_string(),
            needs_compile: self.needs_compile(),
            timeout_ms: self.timeout_ms,
            memory_limit_bytes: self.memory_limit_bytes,
            security_tier: self.security_tier,
            aliases: self.aliases.clone(),
        }
    }
}

/// Public description of a language, as listed to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageSummary {
    pub id: String,
    pub display_name: String,
    pub file_extension: String,
    pub needs_compile: bool,
    pub timeout_ms: u64,
    pub memory_limit_bytes: u64,
    pub security_tier: SecurityTier,
    pub aliases: Vec<String>,
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawLanguageConfig {
    display_name: Option<String>,
    source_file: String,
    compile_command: Option<String>,
    run_command: String,
    timeout_ms: u64,
    memory_limit_mb: u64,
    #[serde(default)]
    security_tier: SecurityTier,
    #[serde(default = "default_true")]
    limit_address_space: bool,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    deny: Vec<RawDenyRule>,
}

#[derive(Debug, Deserialize)]
struct RawDenyRule {
    pattern: String,
    reason: String,
}

fn default_true() -> bool {
    true
}

/// Lookup table from language id or alias to profile
#[derive(Debug, Default)]
pub struct LanguageRegistry {
    profiles: BTreeMap<String, Arc<LanguageProfile>>,
    aliases: HashMap<String, String>,
}

impl LanguageRegistry {
    /// Registry with the bundled language table
    pub fn builtin() -> Result<Self> {
        let content = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));
        Self::from_toml_str(content)
    }

    /// Registry loaded from a TOML file on disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read language config {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid language config {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let raw_configs: HashMap<String, RawLanguageConfig> = toml::from_str(content)?;

        let mut registry = Self::default();
        for (name, raw) in raw_configs {
            let id = name.to_lowercase();

            let run_command = into_command(&raw.run_command);
            if run_command.is_empty() {
                anyhow::bail!("Empty run command for {}", id);
            }
            let compile_command = match raw.compile_command {
                Some(cmd) => {
                    let cmd = into_command(&cmd);
                    if cmd.is_empty() {
                        anyhow::bail!("Empty compile command for {}", id);
                    }
                    Some(cmd)
                }
                None => None,
            };
            if raw.timeout_ms == 0 {
                anyhow::bail!("Timeout for {} must be positive", id);
            }
            if raw.memory_limit_mb == 0 {
                anyhow::bail!("Memory limit for {} must be positive", id);
            }

            let deny_rules = raw
                .deny
                .iter()
                .map(|rule| DenyRule::new(&rule.pattern, rule.reason.clone()))
                .collect::<Result<Vec<_>>>()
                .with_context(|| format!("Invalid deny rules for {}", id))?;

            let profile = LanguageProfile {
                id: id.clone(),
                display_name: raw.display_name.unwrap_or_else(|| name.clone()),
                source_file: raw.source_file,
                compile_command,
                run_command,
                timeout_ms: raw.timeout_ms,
                memory_limit_bytes: raw.memory_limit_mb * 1024 * 1024,
                security_tier: raw.security_tier,
                limit_address_space: raw.limit_address_space,
                aliases: raw.aliases.iter().map(|a| a.to_lowercase()).collect(),
                deny_rules,
            };

            registry.insert(profile);
        }

        Ok(registry)
    }

    /// Add a profile (and its aliases), replacing any previous one with the same id
    pub fn insert(&mut self, profile: LanguageProfile) {
        for alias in &profile.aliases {
            self.aliases.insert(alias.clone(), profile.id.clone());
        }
        self.profiles.insert(profile.id.clone(), Arc::new(profile));
    }

    /// Get a language profile by id or alias
    pub fn get(&self, language: &str) -> Option<Arc<LanguageProfile>> {
        let key = language.trim().to_lowercase();
        if let Some(profile) = self.profiles.get(&key) {
            return Some(Arc::clone(profile));
        }
        let id = self.aliases.get(&key)?;
        self.profiles.get(id).cloned()
    }

    /// All supported languages, sorted by id
    pub fn supported(&self) -> Vec<LanguageSummary> {
        self.profiles.values().map(|p| p.summary()).collect()
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}
