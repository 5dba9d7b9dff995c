//! Typed rule records and their iptables-restore encoding.
//!
//! The synchronizer builds a [`RestoreData`] out of [`Rule`]s and only turns
//! it into text with [`RestoreData::render`] right before handing it to the
//! kernel, so tests can inspect the structured form.

use std::collections::{BTreeMap, HashSet};

use pkg_types::service::Protocol;

use crate::iptables::{Table, make_chain_line};

/// A single match clause of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Match {
    Comment(String),
    /// `-m <proto> -p <proto>`
    Protocol(Protocol),
    Source { cidr: String, negated: bool },
    Destination(String),
    DestPort(u16),
    /// `-m statistic --mode random --probability <p>`
    Probability(String),
    /// Matches clients seen in the `name` list within `seconds`.
    RecentCheck { name: String, seconds: u32 },
    /// Records the client in the `name` list.
    RecentSet { name: String },
    DstTypeLocal,
    NotSrcTypeLocal,
    NotPhysdevIsIn,
    Mark(String),
    CtState(&'static str),
}

impl Match {
    fn args(&self, quote: bool) -> Vec<String> {
        match self {
            Match::Comment(c) => {
                let comment = if quote {
                    format!("\"{}\"", c)
                } else {
                    c.clone()
                };
                let mut out = strs(&["-m", "comment", "--comment"]);
                out.push(comment);
                out
            }
            Match::Protocol(p) => {
                let p = p.as_iptables();
                strs(&["-m", p, "-p", p])
            }
            Match::Source { cidr, negated: true } => strs(&["!", "-s", cidr]),
            Match::Source { cidr, negated: false } => strs(&["-s", cidr]),
            Match::Destination(cidr) => strs(&["-d", cidr]),
            Match::DestPort(port) => strs(&["--dport", &port.to_string()]),
            Match::Probability(p) => {
                strs(&["-m", "statistic", "--mode", "random", "--probability", p])
            }
            Match::RecentCheck { name, seconds } => strs(&[
                "-m",
                "recent",
                "--name",
                name,
                "--rcheck",
                "--seconds",
                &seconds.to_string(),
                "--reap",
            ]),
            Match::RecentSet { name } => strs(&["-m", "recent", "--name", name, "--set"]),
            Match::DstTypeLocal => strs(&["-m", "addrtype", "--dst-type", "LOCAL"]),
            Match::NotSrcTypeLocal => strs(&["-m", "addrtype", "!", "--src-type", "LOCAL"]),
            Match::NotPhysdevIsIn => strs(&["-m", "physdev", "!", "--physdev-is-in"]),
            Match::Mark(mark) => strs(&["-m", "mark", "--mark", mark]),
            Match::CtState(state) => strs(&["-m", "conntrack", "--ctstate", state]),
        }
    }
}

fn strs(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// What a rule does once it matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Jump(String),
    Accept,
    Drop,
    Reject,
    Masquerade,
    Dnat(String),
    SetMark(String),
}

impl Target {
    fn args(&self) -> Vec<String> {
        match self {
            Target::Jump(chain) => strs(&["-j", chain]),
            Target::Accept => strs(&["-j", "ACCEPT"]),
            Target::Drop => strs(&["-j", "DROP"]),
            Target::Reject => strs(&["-j", "REJECT"]),
            Target::Masquerade => strs(&["-j", "MASQUERADE"]),
            Target::Dnat(dest) => strs(&["-j", "DNAT", "--to-destination", dest]),
            Target::SetMark(mark) => strs(&["-j", "MARK", "--set-xmark", mark]),
        }
    }
}

/// One `-A` line: the chain it lives in, its matches in order, and a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub chain: String,
    pub matches: Vec<Match>,
    pub target: Target,
}

impl Rule {
    /// Start a rule in `chain`. Finish it with [`RuleBuilder::to`] or [`RuleBuilder::jump`].
    pub fn in_chain(chain: &str) -> RuleBuilder {
        RuleBuilder {
            chain: chain.to_string(),
            matches: Vec::new(),
        }
    }

    /// The `--probability` argument, if this is a probabilistic match.
    pub fn probability(&self) -> Option<&str> {
        self.matches.iter().find_map(|m| match m {
            Match::Probability(p) => Some(p.as_str()),
            _ => None,
        })
    }

    pub fn comment(&self) -> Option<&str> {
        self.matches.iter().find_map(|m| match m {
            Match::Comment(c) => Some(c.as_str()),
            _ => None,
        })
    }

    pub fn has(&self, m: &Match) -> bool {
        self.matches.contains(m)
    }

    /// The chain this rule jumps to, if its target is a jump.
    pub fn jump_target(&self) -> Option<&str> {
        match &self.target {
            Target::Jump(chain) => Some(chain),
            _ => None,
        }
    }

    /// Arguments after `-A <chain>`, one token each, unquoted (for `iptables -C/-I/-D`).
    pub fn args(&self) -> Vec<String> {
        let mut out: Vec<String> = self.matches.iter().flat_map(|m| m.args(false)).collect();
        out.extend(self.target.args());
        out
    }

    /// The full restore-format line.
    pub fn render(&self) -> String {
        let mut out = vec!["-A".to_string(), self.chain.clone()];
        out.extend(self.matches.iter().flat_map(|m| m.args(true)));
        out.extend(self.target.args());
        out.join(" ")
    }
}

/// Accumulates matches; consumed by choosing a target.
#[derive(Debug, Clone)]
pub struct RuleBuilder {
    chain: String,
    matches: Vec<Match>,
}

impl RuleBuilder {
    pub fn with(mut self, m: Match) -> Self {
        self.matches.push(m);
        self
    }

    pub fn comment(self, comment: impl Into<String>) -> Self {
        self.with(Match::Comment(comment.into()))
    }

    pub fn protocol(self, protocol: Protocol) -> Self {
        self.with(Match::Protocol(protocol))
    }

    pub fn source(self, cidr: impl Into<String>) -> Self {
        self.with(Match::Source {
            cidr: cidr.into(),
            negated: false,
        })
    }

    pub fn not_source(self, cidr: impl Into<String>) -> Self {
        self.with(Match::Source {
            cidr: cidr.into(),
            negated: true,
        })
    }

    pub fn destination(self, cidr: impl Into<String>) -> Self {
        self.with(Match::Destination(cidr.into()))
    }

    pub fn dport(self, port: u16) -> Self {
        self.with(Match::DestPort(port))
    }

    pub fn to(self, target: Target) -> Rule {
        Rule {
            chain: self.chain,
            matches: self.matches,
            target,
        }
    }

    pub fn jump(self, chain: &str) -> Rule {
        self.to(Target::Jump(chain.to_string()))
    }
}

/// A line in a table's rule section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleLine {
    Append(Rule),
    /// `-X <chain>`
    DeleteChain(String),
}

/// Chain declarations and rule lines for one table.
#[derive(Debug, Clone)]
pub struct TableBuffer {
    table: Table,
    chain_lines: Vec<String>,
    declared: HashSet<String>,
    lines: Vec<RuleLine>,
}

impl TableBuffer {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            chain_lines: Vec::new(),
            declared: HashSet::new(),
            lines: Vec::new(),
        }
    }

    /// Declare `chain`, reusing its saved definition line (and counters) when
    /// one exists. Declaring the same chain twice is a no-op.
    pub fn declare_chain(&mut self, chain: &str, existing: &BTreeMap<String, String>) {
        if !self.declared.insert(chain.to_string()) {
            return;
        }
        match existing.get(chain) {
            Some(line) => self.chain_lines.push(line.clone()),
            None => self.chain_lines.push(make_chain_line(chain)),
        }
    }

    /// Flush and delete a chain. The saved line is re-emitted (which flushes
    /// it in the restore), followed by `-X`.
    pub fn delete_chain(&mut self, chain: &str, existing_line: &str) {
        if self.declared.insert(chain.to_string()) {
            self.chain_lines.push(existing_line.to_string());
        }
        self.lines.push(RuleLine::DeleteChain(chain.to_string()));
    }

    pub fn append(&mut self, rule: Rule) {
        self.lines.push(RuleLine::Append(rule));
    }

    pub fn chain_lines(&self) -> &[String] {
        &self.chain_lines
    }

    pub fn lines(&self) -> &[RuleLine] {
        &self.lines
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.lines.iter().filter_map(|l| match l {
            RuleLine::Append(r) => Some(r),
            RuleLine::DeleteChain(_) => None,
        })
    }

    /// Rules appended to `chain`, in order.
    pub fn rules_in<'a>(&'a self, chain: &'a str) -> impl Iterator<Item = &'a Rule> + 'a {
        self.rules().filter(move |r| r.chain == chain)
    }

    /// Chains scheduled for deletion.
    pub fn deleted_chains(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| match l {
            RuleLine::DeleteChain(c) => Some(c.as_str()),
            RuleLine::Append(_) => None,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.chain_lines.is_empty() && self.lines.is_empty()
    }

    /// Append `*table`, chain lines, rule lines and `COMMIT`.
    pub fn render_into(&self, out: &mut String) {
        out.push('*');
        out.push_str(self.table.as_str());
        out.push('\n');
        for line in &self.chain_lines {
            out.push_str(line);
            out.push('\n');
        }
        for line in &self.lines {
            match line {
                RuleLine::Append(rule) => out.push_str(&rule.render()),
                RuleLine::DeleteChain(chain) => {
                    out.push_str("-X ");
                    out.push_str(chain);
                }
            }
            out.push('\n');
        }
        out.push_str("COMMIT\n");
    }
}

/// A complete two-table restore: filter first, then nat.
#[derive(Debug, Clone)]
pub struct RestoreData {
    pub filter: TableBuffer,
    pub nat: TableBuffer,
}

impl RestoreData {
    pub fn new() -> Self {
        Self {
            filter: TableBuffer::new(Table::Filter),
            nat: TableBuffer::new(Table::Nat),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        self.filter.render_into(&mut out);
        self.nat.render_into(&mut out);
        out
    }
}

impl Default for RestoreData {
    fn default() -> Self {
        Self::new()
    }
}
