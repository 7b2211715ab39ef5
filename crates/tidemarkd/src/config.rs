//! TOML configuration for the tidemark daemon.
//!
//! Every section is optional; a missing config file yields an in-process
//! default with no configured domains.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;
use tidemark_changelog::{DEFAULT_BROADCAST_CAPACITY, DomainOptions};
use tidemark_ecl::{DEFAULT_BATCH_SIZE, DEFAULT_CATCH_UP_TIMEOUT};
use tidemark_types::{ReplicaId, Suffix};

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Replica identity and data location.
    pub node: NodeSection,
    /// Change log storage and reader tuning.
    pub changelog: ChangelogSection,
    /// Replicated naming contexts (`[[domain]]` tables).
    #[serde(rename = "domain")]
    pub domains: Vec<DomainSection>,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Directory holding the change log database.
    pub data_dir: PathBuf,
    /// Identifier stamped into every locally generated CSN.
    pub replica_id: u16,
}

impl Default for NodeSection {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".tidemark"))
            .unwrap_or_else(|| PathBuf::from(".tidemark"));
        Self {
            data_dir,
            replica_id: 1,
        }
    }
}

/// `[changelog]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ChangelogSection {
    /// Backend type: `"fjall"` (default) or `"memory"`.
    pub backend: String,
    /// Changes older than this are removed by `tidemarkd trim`.
    pub purge_delay_secs: u64,
    /// Time budget for replaying stored history to one reader.
    pub catch_up_timeout_secs: u64,
    /// Number of stored changes read per domain at a time.
    pub batch_size: usize,
    /// Per-domain live broadcast capacity.
    pub broadcast_capacity: usize,
}

impl Default for ChangelogSection {
    fn default() -> Self {
        Self {
            backend: "fjall".to_string(),
            purge_delay_secs: 3 * 24 * 60 * 60,
            catch_up_timeout_secs: DEFAULT_CATCH_UP_TIMEOUT.as_secs(),
            batch_size: DEFAULT_BATCH_SIZE,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

/// One `[[domain]]` table.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DomainSection {
    /// Suffix DN of the naming context.
    pub suffix: String,
    /// Hide the domain from unprivileged change log readers.
    pub private: bool,
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log level filter (e.g. `"info"`, `"debug"`, `"warn"`).
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or use defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("cannot read {}", p.display()))?;
                let config: CliConfig = toml::from_str(&content)?;
                Ok(config)
            }
            None => Ok(Self::default()),
        }
    }

    /// Parse config from a TOML string (used in tests).
    #[cfg(test)]
    pub fn from_toml(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }

    pub fn replica_id(&self) -> ReplicaId {
        ReplicaId::new(self.node.replica_id)
    }

    /// Whether the change log lives only in memory.
    pub fn is_memory(&self) -> anyhow::Result<bool> {
        match self.changelog.backend.as_str() {
            "fjall" => Ok(false),
            "memory" => Ok(true),
            other => bail!("unknown changelog backend {other:?} (expected \"fjall\" or \"memory\")"),
        }
    }

    /// Location of the Fjall database under the data directory.
    pub fn store_path(&self) -> PathBuf {
        self.node.data_dir.join("changelog")
    }

    pub fn purge_delay(&self) -> Duration {
        Duration::from_secs(self.changelog.purge_delay_secs)
    }

    pub fn catch_up_timeout(&self) -> Duration {
        Duration::from_secs(self.changelog.catch_up_timeout_secs)
    }

    /// Validated `(suffix, options)` pairs for every `[[domain]]` table.
    pub fn domains(&self) -> anyhow::Result<Vec<(Suffix, DomainOptions)>> {
        let mut out: Vec<(Suffix, DomainOptions)> = Vec::with_capacity(self.domains.len());
        for section in &self.domains {
            let suffix = Suffix::new(&section.suffix)
                .with_context(|| format!("invalid domain suffix {:?}", section.suffix))?;
            if out.iter().any(|(s, _)| *s == suffix) {
                bail!("domain {suffix} is configured twice");
            }
            let options = DomainOptions {
                private: section.private,
                broadcast_capacity: self.changelog.broadcast_capacity,
            };
            out.push((suffix, options));
        }
        Ok(out)
    }
}
