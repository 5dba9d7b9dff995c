//! In-memory stand-ins for the kernel-facing traits.
//!
//! [`FakeIptables`] interprets restore buffers the way `iptables-restore
//! --noflush` does: a declared chain is created or flushed, `-A` appends,
//! `-X` deletes, and a table only changes once its `COMMIT` line is reached
//! without error.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};

use pkg_types::service::Protocol;

use crate::addresses::NodeAddresses;
use crate::conntrack::{Conntrack, ConntrackError};
use crate::iptables::{FlushMode, Iptables, IptablesError, RestoreCounters, RulePosition, Table};
use crate::ports::{HeldSocket, LocalPort, PortOpener};

const FILTER_BUILTINS: &[&str] = &["INPUT", "FORWARD", "OUTPUT"];
const NAT_BUILTINS: &[&str] = &["PREROUTING", "INPUT", "OUTPUT", "POSTROUTING"];

fn builtins(table: Table) -> &'static [&'static str] {
    match table {
        Table::Filter => FILTER_BUILTINS,
        Table::Nat => NAT_BUILTINS,
    }
}

#[derive(Debug, Clone, Default)]
struct FakeChain {
    /// Counters as given in the last definition line.
    counters: String,
    /// Rule bodies, i.e. everything after `-A <chain> `.
    rules: Vec<String>,
}

#[derive(Debug, Clone)]
struct FakeTable {
    chains: BTreeMap<String, FakeChain>,
}

impl FakeTable {
    fn new(table: Table) -> Self {
        let chains = builtins(table)
            .iter()
            .map(|c| {
                (
                    c.to_string(),
                    FakeChain {
                        counters: "[0:0]".to_string(),
                        rules: Vec::new(),
                    },
                )
            })
            .collect();
        Self { chains }
    }

    fn is_referenced(&self, chain: &str) -> bool {
        let jump = format!("-j {}", chain);
        self.chains.values().flat_map(|c| c.rules.iter()).any(|r| {
            r.ends_with(&jump) || r.contains(&format!("{} ", jump))
        })
    }

    fn render(&self, table: Table) -> String {
        let builtin = builtins(table);
        let ordered: Vec<&String> = builtin
            .iter()
            .filter_map(|b| self.chains.get_key_value(*b).map(|(k, _)| k))
            .chain(self.chains.keys().filter(|k| !builtin.contains(&k.as_str())))
            .collect();

        let mut out = format!("*{}\n", table.as_str());
        for name in &ordered {
            let policy = if builtin.contains(&name.as_str()) {
                "ACCEPT"
            } else {
                "-"
            };
            out.push_str(&format!(":{} {} {}\n", name, policy, self.chains[*name].counters));
        }
        for name in &ordered {
            for rule in &self.chains[*name].rules {
                out.push_str(&format!("-A {} {}\n", name, rule));
            }
        }
        out.push_str("COMMIT\n");
        out
    }
}

#[derive(Debug)]
struct FakeIptablesState {
    filter: FakeTable,
    nat: FakeTable,
    restores: Vec<String>,
    fail_restores: usize,
    fail_saves: bool,
}

impl FakeIptablesState {
    fn table(&self, table: Table) -> &FakeTable {
        match table {
            Table::Filter => &self.filter,
            Table::Nat => &self.nat,
        }
    }

    fn table_mut(&mut self, table: Table) -> &mut FakeTable {
        match table {
            Table::Filter => &mut self.filter,
            Table::Nat => &mut self.nat,
        }
    }
}

/// In-memory [`Iptables`].
#[derive(Debug)]
pub struct FakeIptables {
    ipv6: bool,
    state: Mutex<FakeIptablesState>,
}

impl Default for FakeIptables {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeIptables {
    pub fn new() -> Self {
        Self {
            ipv6: false,
            state: Mutex::new(FakeIptablesState {
                filter: FakeTable::new(Table::Filter),
                nat: FakeTable::new(Table::Nat),
                restores: Vec::new(),
                fail_restores: 0,
                fail_saves: false,
            }),
        }
    }

    pub fn new_ipv6() -> Self {
        Self {
            ipv6: true,
            ..Self::new()
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeIptablesState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `n` restores fail without touching any table.
    pub fn fail_next_restores(&self, n: usize) {
        self.lock().fail_restores = n;
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.lock().fail_saves = fail;
    }

    /// Every buffer handed to `restore_all`, including failed ones.
    pub fn restores(&self) -> Vec<String> {
        self.lock().restores.clone()
    }

    pub fn last_restore(&self) -> Option<String> {
        self.lock().restores.last().cloned()
    }

    pub fn restore_count(&self) -> usize {
        self.lock().restores.len()
    }

    /// Full `-A <chain> ...` lines of `chain`, in order.
    pub fn rules(&self, table: Table, chain: &str) -> Vec<String> {
        self.lock()
            .table(table)
            .chains
            .get(chain)
            .map(|c| c.rules.iter().map(|r| format!("-A {} {}", chain, r)).collect())
            .unwrap_or_default()
    }

    pub fn chains(&self, table: Table) -> Vec<String> {
        self.lock().table(table).chains.keys().cloned().collect()
    }

    pub fn has_chain(&self, table: Table, chain: &str) -> bool {
        self.lock().table(table).chains.contains_key(chain)
    }

    /// Synchronous equivalent of `save_into`.
    pub fn dump(&self, table: Table) -> String {
        self.lock().table(table).render(table)
    }

    /// Seed a table with save-format text as if restored with `--noflush`.
    pub fn load(&self, data: &str) -> Result<(), IptablesError> {
        let mut state = self.lock();
        apply_restore(&mut state, data, FlushMode::NoFlush)
    }
}

fn restore_error(line: usize, msg: impl Into<String>) -> IptablesError {
    IptablesError::Exit {
        command: "iptables-restore".to_string(),
        status: 2,
        stderr: format!("line {}: {}", line, msg.into()),
    }
}

fn apply_restore(
    state: &mut FakeIptablesState,
    data: &str,
    flush: FlushMode,
) -> Result<(), IptablesError> {
    let mut pending: Option<(Table, FakeTable)> = None;
    let mut commits = Vec::new();

    for (n, raw) in data.lines().enumerate() {
        let n = n + 1;
        let line = raw.trim_end();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some(name) = line.strip_prefix('*') {
            if pending.is_some() {
                return Err(restore_error(n, "table started before COMMIT"));
            }
            let table = match name {
                "filter" => Table::Filter,
                "nat" => Table::Nat,
                other => return Err(restore_error(n, format!("unknown table {}", other))),
            };
            let mut working = state.table(table).clone();
            if flush == FlushMode::Flush {
                working = FakeTable::new(table);
            }
            pending = Some((table, working));
            continue;
        }
        let Some((table, working)) = pending.as_mut() else {
            return Err(restore_error(n, "no table selected"));
        };
        if line == "COMMIT" {
            commits.push((*table, working.clone()));
            pending = None;
        } else if let Some(rest) = line.strip_prefix(':') {
            let (name, tail) = rest.split_once(' ').unwrap_or((rest, ""));
            let counters = tail
                .split_once(' ')
                .map(|(_, c)| c)
                .filter(|c| !c.is_empty())
                .unwrap_or("[0:0]")
                .to_string();
            let chain = working.chains.entry(name.to_string()).or_default();
            chain.rules.clear();
            chain.counters = counters;
        } else if let Some(rest) = line.strip_prefix("-A ") {
            let (chain, body) = rest
                .split_once(' ')
                .ok_or_else(|| restore_error(n, "rule without body"))?;
            match working.chains.get_mut(chain) {
                Some(c) => c.rules.push(body.to_string()),
                None => {
                    return Err(restore_error(n, format!("chain {} does not exist", chain)));
                }
            }
        } else if let Some(chain) = line.strip_prefix("-X ") {
            let chain = chain.trim();
            if builtins(*table).contains(&chain) {
                return Err(restore_error(n, format!("cannot delete builtin {}", chain)));
            }
            if !working.chains.contains_key(chain) {
                return Err(restore_error(n, format!("chain {} does not exist", chain)));
            }
            if working.is_referenced(chain) {
                return Err(restore_error(n, format!("chain {} is still referenced", chain)));
            }
            working.chains.remove(chain);
        } else {
            return Err(restore_error(n, format!("unsupported line {:?}", line)));
        }
    }

    if pending.is_some() {
        return Err(restore_error(data.lines().count(), "missing COMMIT"));
    }
    for (table, working) in commits {
        *state.table_mut(table) = working;
    }
    Ok(())
}

/// Joins argv tokens the way iptables-save prints them.
fn rule_body(args: &[String]) -> String {
    args.iter()
        .map(|a| {
            if a.contains(' ') {
                format!("\"{}\"", a)
            } else {
                a.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl Iptables for FakeIptables {
    async fn ensure_chain(&self, table: Table, chain: &str) -> Result<bool, IptablesError> {
        let mut state = self.lock();
        let chains = &mut state.table_mut(table).chains;
        if chains.contains_key(chain) {
            return Ok(true);
        }
        chains.insert(
            chain.to_string(),
            FakeChain {
                counters: "[0:0]".to_string(),
                rules: Vec::new(),
            },
        );
        Ok(false)
    }

    async fn ensure_rule(
        &self,
        position: RulePosition,
        table: Table,
        chain: &str,
        args: &[String],
    ) -> Result<bool, IptablesError> {
        let body = rule_body(args);
        let mut state = self.lock();
        let Some(c) = state.table_mut(table).chains.get_mut(chain) else {
            return Err(IptablesError::Exit {
                command: format!("iptables -t {} -C {}", table, chain),
                status: 1,
                stderr: "iptables: No chain/target/match by that name.".to_string(),
            });
        };
        if c.rules.contains(&body) {
            return Ok(true);
        }
        match position {
            RulePosition::Prepend => c.rules.insert(0, body),
            RulePosition::Append => c.rules.push(body),
        }
        Ok(false)
    }

    async fn delete_rule(
        &self,
        table: Table,
        chain: &str,
        args: &[String],
    ) -> Result<(), IptablesError> {
        let body = rule_body(args);
        let mut state = self.lock();
        if let Some(c) = state.table_mut(table).chains.get_mut(chain) {
            c.rules.retain(|r| *r != body);
        }
        Ok(())
    }

    async fn save_into(&self, table: Table) -> Result<String, IptablesError> {
        let state = self.lock();
        if state.fail_saves {
            return Err(IptablesError::Exit {
                command: format!("iptables-save -t {}", table),
                status: 1,
                stderr: "injected failure".to_string(),
            });
        }
        Ok(state.table(table).render(table))
    }

    async fn restore_all(
        &self,
        data: &[u8],
        flush: FlushMode,
        _counters: RestoreCounters,
    ) -> Result<(), IptablesError> {
        let text = String::from_utf8_lossy(data).into_owned();
        let mut state = self.lock();
        state.restores.push(text.clone());
        if state.fail_restores > 0 {
            state.fail_restores -= 1;
            return Err(restore_error(0, "injected failure"));
        }
        apply_restore(&mut state, &text, flush)
    }

    fn is_ipv6(&self) -> bool {
        self.ipv6
    }
}

/// A recorded conntrack flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConntrackCall {
    Ip { ip: String, protocol: Protocol },
    Port { port: u16, protocol: Protocol },
    Nat { origin: String, dest: String, protocol: Protocol },
}

/// [`Conntrack`] that records its calls.
#[derive(Debug, Default)]
pub struct FakeConntrack {
    calls: Mutex<Vec<ConntrackCall>>,
}

impl FakeConntrack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<ConntrackCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn record(&self, call: ConntrackCall) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(call);
    }
}

#[async_trait]
impl Conntrack for FakeConntrack {
    async fn clear_entries_for_ip(&self, ip: &str, protocol: Protocol) -> Result<(), ConntrackError> {
        self.record(ConntrackCall::Ip {
            ip: ip.to_string(),
            protocol,
        });
        Ok(())
    }

    async fn clear_entries_for_port(
        &self,
        port: u16,
        _ipv6: bool,
        protocol: Protocol,
    ) -> Result<(), ConntrackError> {
        if port == 0 {
            return Err(ConntrackError::InvalidPort(port));
        }
        self.record(ConntrackCall::Port { port, protocol });
        Ok(())
    }

    async fn clear_entries_for_nat(
        &self,
        origin: &str,
        dest: &str,
        protocol: Protocol,
    ) -> Result<(), ConntrackError> {
        self.record(ConntrackCall::Nat {
            origin: origin.to_string(),
            dest: dest.to_string(),
            protocol,
        });
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PortBook {
    live: HashMap<LocalPort, usize>,
    opens: HashMap<LocalPort, usize>,
    failing: HashSet<u16>,
}

/// [`PortOpener`] that tracks which ports are open without binding anything.
#[derive(Debug, Default)]
pub struct FakePortOpener {
    book: Arc<Mutex<PortBook>>,
}

#[derive(Debug)]
struct FakeSocket {
    port: LocalPort,
    book: Arc<Mutex<PortBook>>,
}

impl HeldSocket for FakeSocket {}

impl Drop for FakeSocket {
    fn drop(&mut self) {
        let mut book = self.book.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(n) = book.live.get_mut(&self.port) {
            *n -= 1;
            if *n == 0 {
                book.live.remove(&self.port);
            }
        }
    }
}

impl FakePortOpener {
    pub fn new() -> Self {
        Self::default()
    }

    fn book(&self) -> std::sync::MutexGuard<'_, PortBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every later open of `port` fail with `AddrInUse`.
    pub fn fail_on(&self, port: u16) {
        self.book().failing.insert(port);
    }

    /// How many times `port` has been opened.
    pub fn open_count(&self, port: &LocalPort) -> usize {
        self.book().opens.get(port).copied().unwrap_or(0)
    }

    pub fn is_open(&self, port: &LocalPort) -> bool {
        self.book().live.contains_key(port)
    }

    /// Ports with a live socket.
    pub fn open_ports(&self) -> Vec<LocalPort> {
        self.book().live.keys().cloned().collect()
    }
}

impl PortOpener for FakePortOpener {
    fn open_local_port(&self, port: &LocalPort) -> std::io::Result<Box<dyn HeldSocket>> {
        let mut book = self.book();
        if book.failing.contains(&port.port) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                format!("port {} already in use", port.port),
            ));
        }
        *book.opens.entry(port.clone()).or_default() += 1;
        *book.live.entry(port.clone()).or_default() += 1;
        Ok(Box::new(FakeSocket {
            port: port.clone(),
            book: self.book.clone(),
        }))
    }
}

/// Fixed [`NodeAddresses`].
#[derive(Debug, Default)]
pub struct FakeNodeAddresses {
    addrs: Mutex<Vec<IpAddr>>,
}

impl FakeNodeAddresses {
    /// Unparseable entries are ignored.
    pub fn new(addrs: &[&str]) -> Self {
        let fake = Self::default();
        fake.set(addrs);
        fake
    }

    pub fn set(&self, addrs: &[&str]) {
        *self.addrs.lock().unwrap_or_else(PoisonError::into_inner) =
            addrs.iter().filter_map(|a| a.parse().ok()).collect();
    }
}

impl NodeAddresses for FakeNodeAddresses {
    fn local_addresses(&self) -> anyhow::Result<Vec<IpAddr>> {
        Ok(self.addrs.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn restore_declares_appends_and_deletes() {
        let ipt = FakeIptables::new();
        ipt.restore_all(
            b"*nat\n:KUBE-SERVICES - [0:0]\n:KUBE-SVC-A - [0:0]\n-A KUBE-SERVICES -m comment --comment \"x y\" -j KUBE-SVC-A\nCOMMIT\n",
            FlushMode::NoFlush,
            RestoreCounters::Restore,
        )
        .await
        .unwrap();
        assert_eq!(
            ipt.rules(Table::Nat, "KUBE-SERVICES"),
            vec!["-A KUBE-SERVICES -m comment --comment \"x y\" -j KUBE-SVC-A"]
        );

        // Redeclaring flushes, which frees KUBE-SVC-A for deletion.
        ipt.restore_all(
            b"*nat\n:KUBE-SERVICES - [0:0]\n:KUBE-SVC-A - [0:0]\n-X KUBE-SVC-A\nCOMMIT\n",
            FlushMode::NoFlush,
            RestoreCounters::Restore,
        )
        .await
        .unwrap();
        assert!(ipt.rules(Table::Nat, "KUBE-SERVICES").is_empty());
        assert!(!ipt.has_chain(Table::Nat, "KUBE-SVC-A"));
        assert!(ipt.has_chain(Table::Nat, "POSTROUTING"));
    }

    #[tokio::test]
    async fn failed_restore_changes_nothing() {
        let ipt = FakeIptables::new();
        let before = ipt.dump(Table::Nat);
        let err = ipt
            .restore_all(
                b"*nat\n:KUBE-SERVICES - [0:0]\n-A KUBE-MISSING -j ACCEPT\nCOMMIT\n",
                FlushMode::NoFlush,
                RestoreCounters::Restore,
            )
            .await;
        assert!(err.is_err());
        assert_eq!(ipt.dump(Table::Nat), before);
        assert!(!ipt.has_chain(Table::Nat, "KUBE-SERVICES"));
    }

    #[tokio::test]
    async fn referenced_chain_cannot_be_deleted() {
        let ipt = FakeIptables::new();
        ipt.load("*nat\n:KUBE-A - [0:0]\n:KUBE-B - [0:0]\n-A KUBE-A -j KUBE-B\nCOMMIT\n")
            .unwrap();
        let res = ipt
            .restore_all(b"*nat\n-X KUBE-B\nCOMMIT\n", FlushMode::NoFlush, RestoreCounters::Restore)
            .await;
        assert!(res.is_err());
        assert!(ipt.has_chain(Table::Nat, "KUBE-B"));
    }

    #[tokio::test]
    async fn ensure_rule_quotes_and_is_idempotent() {
        let ipt = FakeIptables::new();
        let args: Vec<String> = ["-m", "comment", "--comment", "kubernetes service portals", "-j", "KUBE-SERVICES"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(!ipt.ensure_chain(Table::Nat, "KUBE-SERVICES").await.unwrap());
        assert!(!ipt
            .ensure_rule(RulePosition::Prepend, Table::Nat, "OUTPUT", &args)
            .await
            .unwrap());
        assert!(ipt
            .ensure_rule(RulePosition::Prepend, Table::Nat, "OUTPUT", &args)
            .await
            .unwrap());
        assert_eq!(
            ipt.rules(Table::Nat, "OUTPUT"),
            vec!["-A OUTPUT -m comment --comment \"kubernetes service portals\" -j KUBE-SERVICES"]
        );
        ipt.delete_rule(Table::Nat, "OUTPUT", &args).await.unwrap();
        assert!(ipt.rules(Table::Nat, "OUTPUT").is_empty());
    }

    #[test]
    fn save_lists_builtins_first() {
        let ipt = FakeIptables::new();
        ipt.load("*filter\n:KUBE-FORWARD - [4:240]\nCOMMIT\n").unwrap();
        assert_eq!(
            ipt.dump(Table::Filter),
            "*filter\n:INPUT ACCEPT [0:0]\n:FORWARD ACCEPT [0:0]\n:OUTPUT ACCEPT [0:0]\n:KUBE-FORWARD - [4:240]\nCOMMIT\n"
        );
    }
}
