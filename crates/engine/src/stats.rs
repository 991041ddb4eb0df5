//! Per-root statistics.

use core::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::config::Micros;

/// Counters kept per root, exposed through the RootStats verb.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct RootStats {
    pub compares_done: u64,
    pub last_compare_micros: u64,
    pub updates_done: u64,
    pub last_update_micros: u64,
    pub nodes_created: u64,
    pub nodes_shared: u64,
    pub names_added: u64,
    pub names_inserted: u64,
    pub root_advise_sent: u64,
    pub root_advise_seen: u64,
    pub root_advise_received: u64,
    pub root_advise_timeout: u64,
    pub root_advise_failed: u64,
    pub root_advise_bytes: u64,
    pub node_fetch_sent: u64,
    pub node_fetch_seen: u64,
    pub node_fetch_received: u64,
    pub node_fetch_timeout: u64,
    pub node_fetch_failed: u64,
    pub node_fetch_bytes: u64,
    pub content_fetch_sent: u64,
    pub content_fetch_received: u64,
    pub content_fetch_timeout: u64,
    pub content_fetch_failed: u64,
    pub content_fetch_bytes: u64,
}

macro_rules! stats_line {
    ($out:expr, $stats:expr, $field:ident) => {
        if $stats.$field != 0 {
            let _ = write!($out, ", {} {}", stringify!($field), $stats.$field);
        }
    };
}

impl RootStats {
    /// Appends the non-zero counters as `", key value"` text, the format
    /// served in RootStats responses.
    pub fn format_into(&self, out: &mut String) {
        stats_line!(out, self, compares_done);
        stats_line!(out, self, last_compare_micros);
        stats_line!(out, self, updates_done);
        stats_line!(out, self, last_update_micros);
        stats_line!(out, self, nodes_created);
        stats_line!(out, self, nodes_shared);
        stats_line!(out, self, names_added);
        stats_line!(out, self, names_inserted);
        stats_line!(out, self, root_advise_sent);
        stats_line!(out, self, root_advise_seen);
        stats_line!(out, self, root_advise_received);
        stats_line!(out, self, root_advise_timeout);
        stats_line!(out, self, root_advise_failed);
        stats_line!(out, self, root_advise_bytes);
        stats_line!(out, self, node_fetch_sent);
        stats_line!(out, self, node_fetch_seen);
        stats_line!(out, self, node_fetch_received);
        stats_line!(out, self, node_fetch_timeout);
        stats_line!(out, self, node_fetch_failed);
        stats_line!(out, self, node_fetch_bytes);
        stats_line!(out, self, content_fetch_sent);
        stats_line!(out, self, content_fetch_received);
        stats_line!(out, self, content_fetch_timeout);
        stats_line!(out, self, content_fetch_failed);
        stats_line!(out, self, content_fetch_bytes);
    }
}

/// Formats a microsecond instant as `secs.micros`.
pub(crate) fn format_instant(micros: Micros) -> String {
    format!("{}.{:06}", micros / 1_000_000, micros % 1_000_000)
}
