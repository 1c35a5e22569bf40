//! View logging policy
//!
//! Decides which read requests become `view` events and how sensitive they
//! are. Staff area prefixes and the high sensitivity patterns default to the
//! clinic application's audited pages.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};
use crate::ledger::{Sensitivity, Target};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewLoggingMode {
    /// Every read request is logged
    All,
    /// Only paths under an audited prefix are logged
    #[default]
    Selected,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewLoggingConfig {
    pub mode: ViewLoggingMode,
    pub audited_prefixes: Vec<String>,
    pub high_sensitivity_patterns: Vec<String>,
}

impl Default for ViewLoggingConfig {
    fn default() -> Self {
        Self {
            mode: ViewLoggingMode::Selected,
            audited_prefixes: [
                "/inventory/",
                "/practice/",
                "/referrals/",
                "/pharmacy/",
                "/crm/",
                "/billing/",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            high_sensitivity_patterns: [
                r"^/referrals/outbound/",
                r"^/pharmacy/prescriptions/",
                r"^/practice/settings/",
                r"^/billing/invoices/",
                r"^/crm/customers/\d+/",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

/// Compiled form of [`ViewLoggingConfig`]
#[derive(Debug, Clone)]
pub struct ViewPolicy {
    mode: ViewLoggingMode,
    audited_prefixes: Vec<String>,
    high_sensitivity: Vec<Regex>,
}

impl ViewPolicy {
    pub fn compile(config: &ViewLoggingConfig) -> Result<Self> {
        let high_sensitivity = config
            .high_sensitivity_patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|e| {
                    LedgerError::Config(format!(
                        "Invalid high sensitivity pattern {:?}: {}",
                        pattern, e
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            mode: config.mode,
            audited_prefixes: config.audited_prefixes.clone(),
            high_sensitivity,
        })
    }

    pub fn mode(&self) -> ViewLoggingMode {
        self.mode
    }

    pub fn should_log(&self, path: &str) -> bool {
        match self.mode {
            ViewLoggingMode::All => true,
            ViewLoggingMode::None => false,
            ViewLoggingMode::Selected => self
                .audited_prefixes
                .iter()
                .any(|prefix| path.starts_with(prefix.as_str())),
        }
    }

    pub fn sensitivity(&self, path: &str) -> Sensitivity {
        if self.high_sensitivity.iter().any(|re| re.is_match(path)) {
            Sensitivity::High
        } else {
            Sensitivity::Normal
        }
    }
}

impl Default for ViewPolicy {
    fn default() -> Self {
        // The built-in patterns are known to compile
        Self::compile(&ViewLoggingConfig::default()).unwrap_or(Self {
            mode: ViewLoggingMode::Selected,
            audited_prefixes: ViewLoggingConfig::default().audited_prefixes,
            high_sensitivity: Vec::new(),
        })
    }
}

/// Derive the viewed resource from a request path: `/crm/customers/12/`
/// becomes `crm.customers#12`. Without a trailing numeric id the whole path
/// is the entity id.
pub fn target_from_path(path: &str) -> Target {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let (resource, id) = match segments.split_last() {
        Some((last, rest)) if !rest.is_empty() && last.chars().all(|c| c.is_ascii_digit()) => {
            (rest, Some(*last))
        }
        _ => (segments.as_slice(), None),
    };

    let entity_type = if resource.is_empty() {
        "root".to_string()
    } else {
        resource.join(".")
    };
    let entity_id = id.map(str::to_string).unwrap_or_else(|| path.to_string());

    Target::new(entity_type, entity_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selected_mode_uses_prefixes() {
        let policy = ViewPolicy::default();
        assert!(policy.should_log("/crm/customers/4/"));
        assert!(policy.should_log("/billing/invoices/"));
        assert!(!policy.should_log("/appointments/"));
        assert!(!policy.should_log("/"));
    }

    #[test]
    fn test_modes() {
        let mut config = ViewLoggingConfig::default();
        config.mode = ViewLoggingMode::All;
        assert!(ViewPolicy::compile(&config).unwrap().should_log("/appointments/"));

        config.mode = ViewLoggingMode::None;
        assert!(!ViewPolicy::compile(&config).unwrap().should_log("/crm/"));
    }

    #[test]
    fn test_sensitivity_patterns() {
        let policy = ViewPolicy::default();
        assert_eq!(policy.sensitivity("/pharmacy/prescriptions/9/"), Sensitivity::High);
        assert_eq!(policy.sensitivity("/crm/customers/12/edit"), Sensitivity::High);
        assert_eq!(policy.sensitivity("/crm/customers/"), Sensitivity::Normal);
        assert_eq!(policy.sensitivity("/inventory/stock/"), Sensitivity::Normal);
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let config = ViewLoggingConfig {
            high_sensitivity_patterns: vec!["(".to_string()],
            ..ViewLoggingConfig::default()
        };
        assert!(matches!(
            ViewPolicy::compile(&config),
            Err(LedgerError::Config(_))
        ));
    }

    #[test]
    fn test_target_from_path() {
        assert_eq!(
            target_from_path("/crm/customers/12/"),
            Target::new("crm.customers", "12")
        );
        assert_eq!(
            target_from_path("/inventory/stock/"),
            Target::new("inventory.stock", "/inventory/stock/")
        );
    }
}
