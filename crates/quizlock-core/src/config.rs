use crate::error::{QuizlockError, QuizlockResult};
use crate::fingerprint::ExemptSubnets;
use crate::types::UserId;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StorageCfg {
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Allow unlocks on installs whose audit table was never created.
    #[serde(default)]
    pub tolerate_missing_audit_table: bool,
}

fn default_database_path() -> String {
    "/var/lib/quizlock/quizlock.db".to_string()
}

impl Default for StorageCfg {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            tolerate_missing_audit_table: false,
        }
    }
}

/// One deployment instance of the session-binding rule.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RuleProfileCfg {
    pub name: String,

    /// Table namespace; defaults to `quizaccess_<name>`.
    #[serde(default)]
    pub table_prefix: Option<String>,

    /// Flag written into a quiz's settings row when it is first configured.
    #[serde(default)]
    pub default_enabled: bool,

    /// Comma-separated subnets left out of the fingerprint, e.g.
    /// `88.0.0.0/8, 77.77.0.0/16`.
    #[serde(default)]
    pub exempt_subnets: String,
}

impl RuleProfileCfg {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            table_prefix: None,
            default_enabled: false,
            exempt_subnets: String::new(),
        }
    }

    pub fn table_prefix(&self) -> String {
        self.table_prefix
            .clone()
            .unwrap_or_else(|| format!("quizaccess_{}", self.name))
    }
}

fn default_rules() -> Vec<RuleProfileCfg> {
    vec![
        RuleProfileCfg::named("oneconnection"),
        RuleProfileCfg::named("onesession"),
    ]
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct AccessCfg {
    /// Users allowed to release session locks in every quiz.
    #[serde(default)]
    pub supervisors: Vec<UserId>,

    /// Users allowed to enable or disable the rule per quiz.
    #[serde(default)]
    pub editors: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct QuizlockConfig {
    #[serde(default)]
    pub storage: StorageCfg,

    #[serde(default = "default_rules")]
    pub rules: Vec<RuleProfileCfg>,

    #[serde(default)]
    pub access: AccessCfg,

    #[serde(skip)]
    pub path: PathBuf,
}

impl Default for QuizlockConfig {
    fn default() -> Self {
        Self {
            storage: StorageCfg::default(),
            rules: default_rules(),
            access: AccessCfg::default(),
            path: PathBuf::new(),
        }
    }
}

impl QuizlockConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> QuizlockResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut cfg = if matches!(path.extension().and_then(|ext| ext.to_str()), Some(ext) if ext.eq_ignore_ascii_case("toml"))
        {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();

        if cfg.rules.is_empty() {
            return Err(QuizlockError::InvalidConfig(
                "rules must declare at least one profile".to_string(),
            ));
        }

        for rule in &cfg.rules {
            ExemptSubnets::parse(&rule.exempt_subnets)?;
        }

        Ok(cfg)
    }

    /// Collect every problem with the configuration instead of stopping at the first.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        let mut names = HashSet::new();
        let mut prefixes = HashSet::new();

        if self.rules.is_empty() {
            issues.push("rules must declare at least one profile".to_string());
        }
        if self.storage.database_path.trim().is_empty() {
            issues.push("storage.database_path must not be empty".to_string());
        }

        for rule in &self.rules {
            if rule.name.trim().is_empty() {
                issues.push("rule profile with empty name".to_string());
            } else if !names.insert(rule.name.clone()) {
                issues.push(format!("rule `{}` declared more than once", rule.name));
            }

            let prefix = rule.table_prefix();
            let well_formed = !prefix.is_empty()
                && prefix
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
            if !well_formed {
                issues.push(format!(
                    "rule `{}`: table prefix `{prefix}` must match [a-z0-9_]+",
                    rule.name
                ));
            } else if !prefixes.insert(prefix.clone()) {
                issues.push(format!(
                    "rule `{}`: table prefix `{prefix}` is shared with another rule",
                    rule.name
                ));
            }

            if let Err(err) = ExemptSubnets::parse(&rule.exempt_subnets) {
                issues.push(format!("rule `{}`: {err}", rule.name));
            }
        }

        issues
    }

    pub fn rule(&self, name: &str) -> Option<&RuleProfileCfg> {
        self.rules.iter().find(|rule| rule.name == name)
    }

    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.storage.database_path)
    }
}
