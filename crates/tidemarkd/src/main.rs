//! `tidemarkd`: administration for tidemark change logs.
//!
//! Opens the local replica described by the config file and runs one
//! command against it.
//!
//! # Usage
//!
//! ```text
//! tidemarkd status                                   # per-domain state
//! tidemarkd -c tidemark.toml publish -s o=example \
//!     -t uid=bob,o=example -k add -a cn=Bob          # stamp a local change
//! tidemarkd dump                                     # replay the change log
//! tidemarkd dump --cookie 'o=example:...;' --follow  # resume and follow
//! tidemarkd dump --change-number 10 --last-change-number 20
//! tidemarkd cookie                                   # newest cookie
//! tidemarkd trim                                     # purge past the delay
//! tidemarkd benchmark -n 100000 -w 8                 # in-memory throughput
//! ```

mod config;
mod node;
mod telemetry;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tidemark_changelog::{
    Change, ChangelogError, ChangelogStore, DomainOptions, DomainRegistry, Modification,
    ModificationKind, Operation, ReplicationDomain,
};
use tidemark_ecl::{EclEntry, EclEvent, EclRequest, EclSession};
use tidemark_types::{Csn, Suffix, SystemClock};
use tracing::{debug, info};

use config::CliConfig;
use node::{DumpOptions, Node};

// -----------------------------------------------------------------------
// CLI definition
// -----------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "tidemarkd",
    version,
    about = "Multi-master change log administration"
)]
struct Cli {
    /// Path to TOML config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the server state of every configured domain.
    Status,

    /// Apply a local change to one domain and print its CSN.
    Publish {
        /// Suffix of the domain to write to.
        #[arg(short, long)]
        suffix: String,

        /// DN of the changed entry.
        #[arg(short, long)]
        target: String,

        /// Kind of change.
        #[arg(short, long, value_enum, default_value = "add")]
        kind: ChangeKind,

        /// `name=value` attribute; repeat for several values. Adds store
        /// them, modifies replace them.
        #[arg(short, long = "attr")]
        attributes: Vec<String>,

        /// New RDN for `modrdn`.
        #[arg(long)]
        new_rdn: Option<String>,

        /// New parent DN for `modrdn`.
        #[arg(long)]
        new_superior: Option<String>,

        /// Keep the old RDN value on `modrdn`.
        #[arg(long)]
        keep_old_rdn: bool,

        /// Entry UUID of the target.
        #[arg(long)]
        uuid: Option<String>,

        /// DN of the user performing the change.
        #[arg(long)]
        initiator: Option<String>,
    },

    /// Print the external change log.
    Dump {
        /// Resume after this cookie.
        #[arg(long)]
        cookie: Option<String>,

        /// Keep following new changes after the history is replayed.
        #[arg(short, long)]
        follow: bool,

        /// Only print changes whose target DN matches (`*` wildcards).
        #[arg(long)]
        target_pattern: Option<String>,

        /// Include private domains.
        #[arg(long)]
        privileged: bool,

        /// Read by change number, starting at this one. The cookie is
        /// ignored.
        #[arg(long)]
        change_number: Option<u64>,

        /// Stop after this change number.
        #[arg(long, requires = "change_number")]
        last_change_number: Option<u64>,
    },

    /// Print the cookie positioned after the newest change.
    Cookie {
        /// Include private domains.
        #[arg(long)]
        privileged: bool,
    },

    /// Purge old changes from every domain.
    Trim {
        /// Purge changes older than this CSN. Defaults to the configured
        /// purge delay before now.
        #[arg(long)]
        before: Option<String>,
    },

    /// Run an in-memory publish/replay benchmark.
    Benchmark {
        /// Number of changes to publish.
        #[arg(short = 'n', long, default_value = "10000")]
        count: usize,

        /// Number of concurrent writers.
        #[arg(short, long, default_value = "4")]
        writers: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ChangeKind {
    Add,
    Delete,
    Modify,
    Modrdn,
}

// -----------------------------------------------------------------------
// Entrypoint
// -----------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.as_deref()).context("failed to load config")?;

    telemetry::init(&config.log.level);

    match cli.command {
        Commands::Status => cmd_status(&config),
        Commands::Publish {
            suffix,
            target,
            kind,
            attributes,
            new_rdn,
            new_superior,
            keep_old_rdn,
            uuid,
            initiator,
        } => {
            let operation =
                build_operation(kind, &attributes, new_rdn, new_superior, keep_old_rdn)?;
            let mut change = Change::new(target, operation);
            if let Some(uuid) = uuid {
                change = change.with_uuid(uuid);
            }
            if let Some(initiator) = initiator {
                change = change.with_initiator(initiator);
            }
            cmd_publish(&config, &suffix, change)
        }
        Commands::Dump {
            cookie,
            follow,
            target_pattern,
            privileged,
            change_number,
            last_change_number,
        } => {
            let options = DumpOptions {
                cookie,
                follow,
                target_pattern,
                privileged,
                change_number,
                last_change_number,
            };
            cmd_dump(&config, options).await
        }
        Commands::Cookie { privileged } => cmd_cookie(&config, privileged),
        Commands::Trim { before } => cmd_trim(&config, before.as_deref()),
        Commands::Benchmark { count, writers } => cmd_benchmark(&config, count, writers).await,
    }
}

// -----------------------------------------------------------------------
// tidemarkd status
// -----------------------------------------------------------------------

fn cmd_status(config: &CliConfig) -> Result<()> {
    let node = Node::open(config)?;

    println!("Replica: {}", node.replica_id());
    println!(
        "Change numbers: {}..{}",
        node.registry.first_change_number()?,
        node.registry.last_change_number()?
    );
    println!("Newest cookie: {}", node.registry.newest_cookie());
    println!("Domains: {}", node.registry.len());
    for domain in node.registry.domains() {
        let visibility = if domain.is_private() { "private" } else { "public" };
        println!("  {} ({visibility})", domain.suffix());
        println!("    changes: {}", domain.change_count()?);
        println!("    state:   {}", domain.server_state());
        println!("    trimmed: {}", domain.trimmed_state());
    }

    Ok(())
}

// -----------------------------------------------------------------------
// tidemarkd publish
// -----------------------------------------------------------------------

fn cmd_publish(config: &CliConfig, suffix: &str, change: Change) -> Result<()> {
    let node = Node::open(config)?;
    let suffix = Suffix::new(suffix).with_context(|| format!("invalid suffix {suffix:?}"))?;
    let domain = node.registry.require(&suffix)?;

    let record = domain.publish(change)?;
    info!(%suffix, csn = %record.csn, "published change");
    println!("{}", record.csn);
    Ok(())
}

/// Split a `name=value` argument.
fn parse_attribute(arg: &str) -> Result<(String, String)> {
    match arg.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => bail!("attribute {arg:?} is not of the form name=value"),
    }
}

fn build_operation(
    kind: ChangeKind,
    attributes: &[String],
    new_rdn: Option<String>,
    new_superior: Option<String>,
    keep_old_rdn: bool,
) -> Result<Operation> {
    let mut values: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for arg in attributes {
        let (name, value) = parse_attribute(arg)?;
        values.entry(name).or_default().push(value);
    }

    let operation = match kind {
        ChangeKind::Add => Operation::Add { attributes: values },
        ChangeKind::Delete => Operation::Delete,
        ChangeKind::Modify => {
            if values.is_empty() {
                bail!("modify needs at least one --attr");
            }
            let modifications = values
                .into_iter()
                .map(|(name, vals)| Modification::new(ModificationKind::Replace, name, vals))
                .collect();
            Operation::Modify { modifications }
        }
        ChangeKind::Modrdn => {
            let Some(new_rdn) = new_rdn else {
                bail!("modrdn needs --new-rdn");
            };
            Operation::ModifyDn {
                new_rdn,
                new_superior,
                delete_old_rdn: !keep_old_rdn,
            }
        }
    };
    Ok(operation)
}

// -----------------------------------------------------------------------
// tidemarkd dump
// -----------------------------------------------------------------------

async fn cmd_dump(config: &CliConfig, options: DumpOptions) -> Result<()> {
    let node = Node::open(config)?;
    let request = node::ecl_request(config, &options)?;
    let mut session = EclSession::open(&node.registry, request)?;

    let cancel = session.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("interrupted");
            cancel.cancel();
        }
    });

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut count = 0usize;
    loop {
        match session.next().await? {
            EclEvent::Change(entry) => {
                write_entry(&mut out, &entry)?;
                out.flush()?;
                count += 1;
            }
            EclEvent::Done | EclEvent::Cancelled => break,
        }
    }

    writeln!(out, "# entries: {count}")?;
    writeln!(out, "# cookie: {}", session.cookie())?;
    Ok(())
}

/// Write one change log entry as an LDIF-style record. Continuation lines
/// of multi-line values are indented by one space.
fn write_entry(out: &mut impl Write, entry: &EclEntry) -> std::io::Result<()> {
    match entry.change_number {
        Some(number) => writeln!(out, "dn: changeNumber={number},cn=changelog")?,
        None => writeln!(
            out,
            "dn: replicationCSN={},{},cn=changelog",
            entry.record.csn, entry.suffix
        )?,
    }
    for (name, value) in entry.attributes() {
        let mut lines = value.lines();
        writeln!(out, "{name}: {}", lines.next().unwrap_or_default())?;
        for line in lines {
            writeln!(out, " {line}")?;
        }
    }
    writeln!(out)
}

// -----------------------------------------------------------------------
// tidemarkd cookie
// -----------------------------------------------------------------------

fn cmd_cookie(config: &CliConfig, privileged: bool) -> Result<()> {
    let node = Node::open(config)?;
    let request = EclRequest::new().privileged(privileged);
    println!("{}", tidemark_ecl::newest_cookie(&node.registry, &request));
    Ok(())
}

// -----------------------------------------------------------------------
// tidemarkd trim
// -----------------------------------------------------------------------

fn cmd_trim(config: &CliConfig, before: Option<&str>) -> Result<()> {
    let node = Node::open(config)?;
    let bound = match before {
        Some(text) => text
            .parse::<Csn>()
            .with_context(|| format!("invalid CSN {text:?}"))?,
        None => node::purge_bound(config),
    };

    let purged = node.trim_before(&bound)?;
    println!("Purged {purged} changes older than {bound}");
    Ok(())
}

// -----------------------------------------------------------------------
// tidemarkd benchmark
// -----------------------------------------------------------------------

async fn cmd_benchmark(config: &CliConfig, count: usize, writers: usize) -> Result<()> {
    let writers = writers.max(1);
    let suffix = Suffix::new("o=benchmark")?;

    println!("tidemark Benchmark");
    println!("  changes:    {count}");
    println!("  writers:    {writers}");
    println!("  batch_size: {}", config.changelog.batch_size);
    println!();

    // In-memory setup: measures the change log, not the disk.
    let store = Arc::new(ChangelogStore::in_memory());
    let domain = Arc::new(ReplicationDomain::open(
        suffix.clone(),
        config.replica_id(),
        store,
        Arc::new(SystemClock),
        DomainOptions::default(),
    )?);
    let registry = DomainRegistry::new();
    registry.register(Arc::clone(&domain))?;

    // --- Publish ---
    print!("Publishing {count} changes... ");
    std::io::stdout().flush()?;
    let start = Instant::now();
    let mut handles = Vec::with_capacity(writers);
    for w in 0..writers {
        let domain = Arc::clone(&domain);
        let share = count / writers + usize::from(w < count % writers);
        handles.push(tokio::spawn(async move {
            for _ in 0..share {
                let uid: u64 = rand::random();
                let dn = format!("uid={uid:016x},o=benchmark");
                domain.publish(Change::new(dn, Operation::Delete))?;
            }
            Ok::<_, ChangelogError>(())
        }));
    }
    for handle in handles {
        handle.await??;
    }
    let publish_dur = start.elapsed();
    let publish_rate = count as f64 / publish_dur.as_secs_f64();
    println!("{:.2}s ({publish_rate:.0} changes/s)", publish_dur.as_secs_f64());

    // --- Replay ---
    print!("Replaying change log... ");
    std::io::stdout().flush()?;
    let request = node::ecl_request(config, &DumpOptions::default())?;
    let start = Instant::now();
    let mut session = EclSession::open(&registry, request)?;
    let mut replayed = 0usize;
    while let EclEvent::Change(_) = session.next().await? {
        replayed += 1;
    }
    let replay_dur = start.elapsed();
    let replay_rate = replayed as f64 / replay_dur.as_secs_f64();
    println!("{:.2}s ({replay_rate:.0} entries/s)", replay_dur.as_secs_f64());

    if replayed != count {
        bail!("replayed {replayed} entries, expected {count}");
    }

    println!();
    println!("Summary:");
    println!("  Publish throughput: {publish_rate:.0} changes/s");
    println!("  Replay throughput:  {replay_rate:.0} entries/s");
    println!("  Final state:        {}", domain.server_state());

    Ok(())
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
