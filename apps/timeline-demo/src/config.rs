//! Environment-backed runtime configuration for `timeline-demo`.

use std::{env, error::Error, fmt, path::PathBuf};

use timeline_sync::{DEFAULT_GAP_THRESHOLD, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE, SyncConfig};

const DEFAULT_CONVERSATION_ID: &str = "demo-general";
const DEFAULT_CHECKPOINT_PATH: &str = "./.timeline-demo/checkpoints.json";
const DEFAULT_SEED_MESSAGES: usize = 120;

/// Runtime configuration used by the demo binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoConfig {
    /// Conversation simulated by the in-memory source.
    pub conversation_id: String,
    /// Items per snapshot or page request.
    pub page_size: u16,
    /// JSON document holding last-seen checkpoints.
    pub checkpoint_path: PathBuf,
    /// Missed-event count above which the simulated source reports a gap.
    pub gap_threshold: usize,
    /// Messages preloaded into the simulated server history.
    pub seed_messages: usize,
}

impl DemoConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let conversation_id = optional_trimmed_env("TIMELINE_CONVERSATION_ID", &mut lookup)
            .unwrap_or_else(|| DEFAULT_CONVERSATION_ID.to_owned());
        if conversation_id.chars().any(char::is_control) {
            return Err(ConfigError::InvalidValue {
                key: "TIMELINE_CONVERSATION_ID",
                value: conversation_id,
                reason: "must not contain control characters".to_owned(),
            });
        }

        let page_size = parse_optional_u16_with_default(
            "TIMELINE_PAGE_SIZE",
            DEFAULT_PAGE_SIZE,
            &mut lookup,
        )?;
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::InvalidValue {
                key: "TIMELINE_PAGE_SIZE",
                value: page_size.to_string(),
                reason: format!("must be between 1 and {MAX_PAGE_SIZE}"),
            });
        }

        let checkpoint_path = optional_trimmed_env("TIMELINE_CHECKPOINT_PATH", &mut lookup)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CHECKPOINT_PATH));

        let gap_threshold = parse_optional_usize(
            "TIMELINE_GAP_THRESHOLD",
            DEFAULT_GAP_THRESHOLD,
            &mut lookup,
        )?;
        let seed_messages = parse_optional_usize(
            "TIMELINE_SEED_MESSAGES",
            DEFAULT_SEED_MESSAGES,
            &mut lookup,
        )?;
        if seed_messages == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TIMELINE_SEED_MESSAGES",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            conversation_id,
            page_size,
            checkpoint_path,
            gap_threshold,
            seed_messages,
        })
    }

    /// Controller settings derived from this configuration.
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig::new(self.conversation_id.clone()).with_page_size(self.page_size)
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional_u16_with_default<F>(
    key: &'static str,
    default: u16,
    lookup: &mut F,
) -> Result<u16, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value.parse::<u16>().map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}

fn parse_optional_usize<F>(
    key: &'static str,
    default: usize,
    lookup: &mut F,
) -> Result<usize, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value
        .parse::<usize>()
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::HashMap, path::Path};

    fn config_from_pairs(pairs: &[(&str, &str)]) -> Result<DemoConfig, ConfigError> {
        let map = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect::<HashMap<_, _>>();
        DemoConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn uses_defaults_without_environment() {
        let cfg = config_from_pairs(&[]).expect("config should parse");
        assert_eq!(cfg.conversation_id, DEFAULT_CONVERSATION_ID);
        assert_eq!(cfg.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(cfg.checkpoint_path, Path::new(DEFAULT_CHECKPOINT_PATH));
        assert_eq!(cfg.gap_threshold, DEFAULT_GAP_THRESHOLD);
        assert_eq!(cfg.seed_messages, DEFAULT_SEED_MESSAGES);
    }

    #[test]
    fn parses_overrides() {
        let cfg = config_from_pairs(&[
            ("TIMELINE_CONVERSATION_ID", "  team-standup "),
            ("TIMELINE_PAGE_SIZE", "12"),
            ("TIMELINE_CHECKPOINT_PATH", "/tmp/checkpoints.json"),
            ("TIMELINE_GAP_THRESHOLD", "5"),
            ("TIMELINE_SEED_MESSAGES", "40"),
        ])
        .expect("config should parse");

        assert_eq!(cfg.conversation_id, "team-standup");
        assert_eq!(cfg.page_size, 12);
        assert_eq!(cfg.checkpoint_path, PathBuf::from("/tmp/checkpoints.json"));
        assert_eq!(cfg.gap_threshold, 5);
        assert_eq!(cfg.seed_messages, 40);

        let sync = cfg.sync_config();
        assert_eq!(sync.conversation_id, "team-standup");
        assert_eq!(sync.page_size, 12);
    }

    #[test]
    fn rejects_invalid_numeric_values() {
        let err = config_from_pairs(&[("TIMELINE_PAGE_SIZE", "abc")])
            .expect_err("invalid page size should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "TIMELINE_PAGE_SIZE",
                ..
            }
        ));

        let err = config_from_pairs(&[("TIMELINE_GAP_THRESHOLD", "-1")])
            .expect_err("negative threshold should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "TIMELINE_GAP_THRESHOLD",
                ..
            }
        ));
    }

    #[test]
    fn rejects_out_of_range_page_size() {
        for value in ["0", "101"] {
            let err = config_from_pairs(&[("TIMELINE_PAGE_SIZE", value)])
                .expect_err("page size out of range should fail");
            assert!(err.to_string().contains("between 1 and 100"));
        }
    }

    #[test]
    fn rejects_empty_seed_history() {
        let err = config_from_pairs(&[("TIMELINE_SEED_MESSAGES", "0")])
            .expect_err("zero seed messages should fail");
        assert_eq!(
            err.to_string(),
            "invalid TIMELINE_SEED_MESSAGES='0': must be at least 1"
        );
    }
}
