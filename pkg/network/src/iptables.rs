//! iptables access: the [`Iptables`] trait the synchronizer is written
//! against, and [`IptablesRunner`], which shells out to the iptables
//! binaries.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use pkg_constants::paths::{
    IP6TABLES_BIN, IP6TABLES_RESTORE_BIN, IP6TABLES_SAVE_BIN, IPTABLES_BIN, IPTABLES_RESTORE_BIN,
    IPTABLES_SAVE_BIN,
};

/// The two netfilter tables the proxy writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Filter,
    Nat,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where [`Iptables::ensure_rule`] places a missing rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulePosition {
    Prepend,
    Append,
}

/// Whether a restore flushes the tables it mentions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    Flush,
    NoFlush,
}

/// Whether a restore takes packet counters from the chain lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreCounters {
    Restore,
    Reset,
}

/// Failure of an iptables command.
#[derive(Debug, thiserror::Error)]
pub enum IptablesError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{command} exited with status {status}: {stderr}")]
    Exit {
        command: String,
        status: i32,
        stderr: String,
    },
}

impl IptablesError {
    /// True when the command failed because a chain or rule does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            IptablesError::Exit { status, stderr, .. } => {
                *status == 1
                    && (stderr.contains("No chain/target/match by that name")
                        || stderr.contains("does a matching rule exist")
                        || stderr.contains("No such file or directory"))
            }
            IptablesError::Spawn { .. } => false,
        }
    }

    fn exit_status(&self) -> Option<i32> {
        match self {
            IptablesError::Exit { status, .. } => Some(*status),
            IptablesError::Spawn { .. } => None,
        }
    }
}

/// Kernel iptables interface.
///
/// Rule arguments are passed unquoted, one token per element, exactly as they
/// would be handed to `execve`.
#[async_trait]
pub trait Iptables: Send + Sync {
    /// Create `chain` if missing. Returns `true` if it already existed.
    async fn ensure_chain(&self, table: Table, chain: &str) -> Result<bool, IptablesError>;

    /// Check for the rule and insert it at `position` if missing.
    /// Returns `true` if it already existed.
    async fn ensure_rule(
        &self,
        position: RulePosition,
        table: Table,
        chain: &str,
        args: &[String],
    ) -> Result<bool, IptablesError>;

    /// Delete a rule. Deleting a missing rule is not an error.
    async fn delete_rule(&self, table: Table, chain: &str, args: &[String])
    -> Result<(), IptablesError>;

    /// Dump `table` in iptables-restore format.
    async fn save_into(&self, table: Table) -> Result<String, IptablesError>;

    /// Apply a restore buffer covering any number of tables in one call.
    async fn restore_all(
        &self,
        data: &[u8],
        flush: FlushMode,
        counters: RestoreCounters,
    ) -> Result<(), IptablesError>;

    /// Whether this handle programs ip6tables.
    fn is_ipv6(&self) -> bool;
}

/// [`Iptables`] backed by the `iptables`, `iptables-save` and `iptables-restore` binaries.
pub struct IptablesRunner {
    ipv6: bool,
}

impl IptablesRunner {
    pub fn new(ipv6: bool) -> Self {
        Self { ipv6 }
    }

    fn iptables_bin(&self) -> &'static str {
        if self.ipv6 { IP6TABLES_BIN } else { IPTABLES_BIN }
    }

    fn save_bin(&self) -> &'static str {
        if self.ipv6 {
            IP6TABLES_SAVE_BIN
        } else {
            IPTABLES_SAVE_BIN
        }
    }

    fn restore_bin(&self) -> &'static str {
        if self.ipv6 {
            IP6TABLES_RESTORE_BIN
        } else {
            IPTABLES_RESTORE_BIN
        }
    }

    async fn run(
        &self,
        bin: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<String, IptablesError> {
        let command = format!("{} {}", bin, args.join(" "));
        debug!("running {}", command);

        let mut cmd = tokio::process::Command::new(bin);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = cmd.spawn().map_err(|source| IptablesError::Spawn {
            command: bin.to_string(),
            source,
        })?;

        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(data)
                .await
                .map_err(|source| IptablesError::Spawn {
                    command: bin.to_string(),
                    source,
                })?;
            // Close stdin so the child sees EOF.
            drop(pipe);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| IptablesError::Spawn {
                command: bin.to_string(),
                source,
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(IptablesError::Exit {
                command,
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    fn table_args(table: Table, op: &str, chain: &str, rule: &[String]) -> Vec<String> {
        let mut args = vec![
            "-w".to_string(),
            "-t".to_string(),
            table.as_str().to_string(),
            op.to_string(),
            chain.to_string(),
        ];
        args.extend(rule.iter().cloned());
        args
    }

    fn restore_args(flush: FlushMode, counters: RestoreCounters) -> Vec<String> {
        let mut args = vec!["-w".to_string()];
        if flush == FlushMode::NoFlush {
            args.push("--noflush".to_string());
        }
        if counters == RestoreCounters::Restore {
            args.push("--counters".to_string());
        }
        args
    }

    async fn check_rule(
        &self,
        table: Table,
        chain: &str,
        args: &[String],
    ) -> Result<bool, IptablesError> {
        match self
            .run(self.iptables_bin(), &Self::table_args(table, "-C", chain, args), None)
            .await
        {
            Ok(_) => Ok(true),
            // `-C` exits 1 when the rule is absent.
            Err(e) if e.exit_status() == Some(1) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Iptables for IptablesRunner {
    async fn ensure_chain(&self, table: Table, chain: &str) -> Result<bool, IptablesError> {
        match self
            .run(self.iptables_bin(), &Self::table_args(table, "-N", chain, &[]), None)
            .await
        {
            Ok(_) => Ok(false),
            // "Chain already exists."
            Err(e) if e.exit_status() == Some(1) => Ok(true),
            Err(e) => Err(e),
        }
    }

    async fn ensure_rule(
        &self,
        position: RulePosition,
        table: Table,
        chain: &str,
        args: &[String],
    ) -> Result<bool, IptablesError> {
        if self.check_rule(table, chain, args).await? {
            return Ok(true);
        }
        let op = match position {
            RulePosition::Prepend => "-I",
            RulePosition::Append => "-A",
        };
        self.run(self.iptables_bin(), &Self::table_args(table, op, chain, args), None)
            .await?;
        Ok(false)
    }

    async fn delete_rule(
        &self,
        table: Table,
        chain: &str,
        args: &[String],
    ) -> Result<(), IptablesError> {
        if !self.check_rule(table, chain, args).await? {
            return Ok(());
        }
        self.run(self.iptables_bin(), &Self::table_args(table, "-D", chain, args), None)
            .await?;
        Ok(())
    }

    async fn save_into(&self, table: Table) -> Result<String, IptablesError> {
        self.run(
            self.save_bin(),
            &["-t".to_string(), table.as_str().to_string()],
            None,
        )
        .await
    }

    async fn restore_all(
        &self,
        data: &[u8],
        flush: FlushMode,
        counters: RestoreCounters,
    ) -> Result<(), IptablesError> {
        let args = Self::restore_args(flush, counters);
        self.run(self.restore_bin(), &args, Some(data)).await?;
        Ok(())
    }

    fn is_ipv6(&self) -> bool {
        self.ipv6
    }
}

/// Chain-definition line for a fresh, empty chain.
pub fn make_chain_line(chain: &str) -> String {
    format!(":{} - [0:0]", chain)
}

/// Extract the chain-definition lines of `table` from iptables-save output,
/// keyed by chain name. Lines are kept verbatim so counters survive a restore.
pub fn chain_lines(table: Table, save: &str) -> BTreeMap<String, String> {
    let header = format!("*{}", table.as_str());
    let mut chains = BTreeMap::new();
    let mut lines = save.lines().skip_while(|l| !l.starts_with(&header));
    // Skip the header itself.
    lines.next();

    for line in lines {
        let line = line.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with("COMMIT") || line.starts_with('*') {
            break;
        }
        if let Some(rest) = line.strip_prefix(':') {
            let name = rest.split_once(' ').map(|(n, _)| n).unwrap_or(rest);
            if !name.is_empty() {
                chains.insert(name.to_string(), line.to_string());
            }
        }
    }
    chains
}
