//! Opening the local replica: change log store plus one replication domain
//! per configured naming context.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use tidemark_changelog::{ChangelogStore, DomainRegistry, ReplicationDomain};
use tidemark_ecl::{EclRequest, SearchMode, TargetFilter};
use tidemark_types::{Clock, Csn, ReplicaId, SystemClock};
use tracing::{info, warn};

use crate::config::CliConfig;

/// The domains served by this replica.
pub struct Node {
    pub registry: DomainRegistry,
    replica_id: ReplicaId,
}

impl Node {
    /// Open the configured store and register every configured domain.
    pub fn open(config: &CliConfig) -> anyhow::Result<Self> {
        let store = if config.is_memory()? {
            ChangelogStore::in_memory()
        } else {
            std::fs::create_dir_all(&config.node.data_dir)
                .context("failed to create data directory")?;
            let path = config.store_path();
            ChangelogStore::open(&path)
                .with_context(|| format!("cannot open change log at {}", path.display()))?
        };
        Self::with_store(config, Arc::new(store), Arc::new(SystemClock))
    }

    /// Register the configured domains on an already opened store.
    pub fn with_store(
        config: &CliConfig,
        store: Arc<ChangelogStore>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let replica_id = config.replica_id();
        let registry = DomainRegistry::new();

        for (suffix, options) in config.domains()? {
            let domain = ReplicationDomain::open(
                suffix.clone(),
                replica_id,
                Arc::clone(&store),
                Arc::clone(&clock),
                options,
            )
            .with_context(|| format!("cannot open domain {suffix}"))?;
            registry.register(Arc::new(domain))?;
        }

        for suffix in store.suffixes()? {
            if registry.get(&suffix).is_none() {
                warn!(%suffix, "stored change log has no configured domain; ignoring");
            }
        }

        info!(
            replica = %replica_id,
            domains = registry.len(),
            "replica opened"
        );
        Ok(Self {
            registry,
            replica_id,
        })
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Trim every domain. Returns the total number of purged changes.
    pub fn trim_before(&self, bound: &Csn) -> anyhow::Result<usize> {
        let mut total = 0;
        for domain in self.registry.domains() {
            total += domain
                .trim_before(bound)
                .with_context(|| format!("cannot trim {}", domain.suffix()))?;
        }
        Ok(total)
    }
}

/// Options of a `dump` invocation.
#[derive(Debug, Default)]
pub struct DumpOptions {
    pub cookie: Option<String>,
    pub follow: bool,
    pub target_pattern: Option<String>,
    pub privileged: bool,
    pub change_number: Option<u64>,
    pub last_change_number: Option<u64>,
}

/// Build a change log request from the configured reader tuning.
pub fn ecl_request(config: &CliConfig, options: &DumpOptions) -> anyhow::Result<EclRequest> {
    let mut request = EclRequest::new()
        .with_catch_up_timeout(config.catch_up_timeout())
        .with_batch_size(config.changelog.batch_size)
        .privileged(options.privileged);

    if let Some(cookie) = &options.cookie {
        request = request
            .with_cookie_str(cookie)
            .context("invalid change log cookie")?;
    }
    match (options.change_number, options.last_change_number) {
        (Some(first), Some(last)) => {
            anyhow::ensure!(
                first <= last,
                "change number range {first}..{last} is empty"
            );
            request = request.with_change_number_range(first, last);
        }
        (Some(first), None) => request = request.from_change_number(first),
        (None, Some(_)) => anyhow::bail!("--last-change-number needs --change-number"),
        (None, None) => {}
    }
    if options.follow {
        request = request.with_mode(SearchMode::Persistent);
    }
    if let Some(pattern) = &options.target_pattern {
        request = request.with_filter(TargetFilter::pattern(pattern));
    }
    Ok(request)
}

/// Default trim bound: the oldest CSN still inside the purge delay.
pub fn purge_bound(config: &CliConfig) -> Csn {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let delay = config.purge_delay().as_millis() as u64;
    Csn::lower_bound(now.saturating_sub(delay))
}
