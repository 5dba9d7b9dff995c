//! Removal of everything the proxier installs, for `--cleanup` and for
//! switching proxy modes.

use tracing::{error, info};

use pkg_constants::chains::OWNED_CHAIN_PREFIXES;
use pkg_network::iptables::{FlushMode, Iptables, RestoreCounters, Table, chain_lines};
use pkg_network::rules::TableBuffer;

use crate::proxier::{FILTER_STATIC_CHAINS, JUMP_CHAINS, NAT_STATIC_CHAINS};

fn is_owned(table: Table, chain: &str) -> bool {
    match table {
        Table::Filter => FILTER_STATIC_CHAINS.contains(&chain),
        Table::Nat => {
            NAT_STATIC_CHAINS.contains(&chain)
                || OWNED_CHAIN_PREFIXES.iter().any(|p| chain.starts_with(p))
        }
    }
}

/// Delete the jump rules, then flush and delete every proxy chain.
/// Returns `true` if any step failed; missing rules and chains are fine.
pub async fn cleanup_leftovers(ipt: &dyn Iptables) -> bool {
    let mut encountered_error = false;

    for jump in JUMP_CHAINS {
        if let Err(e) = ipt
            .delete_rule(jump.table, jump.source, &jump.rule().args())
            .await
        {
            if !e.is_not_found() {
                error!(
                    "Error removing jump from {} to {} in {}: {}",
                    jump.source, jump.chain, jump.table, e
                );
                encountered_error = true;
            }
        }
    }

    for table in [Table::Nat, Table::Filter] {
        let save = match ipt.save_into(table).await {
            Ok(save) => save,
            Err(e) => {
                error!("Failed to save {} table for cleanup: {}", table, e);
                encountered_error = true;
                continue;
            }
        };

        let mut buf = TableBuffer::new(table);
        for (chain, line) in &chain_lines(table, &save) {
            if is_owned(table, chain) {
                buf.delete_chain(chain, line);
            }
        }
        if buf.is_empty() {
            continue;
        }

        let mut data = String::new();
        buf.render_into(&mut data);
        match ipt
            .restore_all(data.as_bytes(), FlushMode::NoFlush, RestoreCounters::Restore)
            .await
        {
            Ok(()) => info!(
                "Removed {} proxy chains from {}",
                buf.deleted_chains().count(),
                table
            ),
            Err(e) => {
                error!("Failed to remove proxy chains from {}: {}", table, e);
                encountered_error = true;
            }
        }
    }

    encountered_error
}
