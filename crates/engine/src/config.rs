//! Engine configuration.
//!
//! Every tunable is reachable by name here; there are no hidden globals.
//! Durations are kept in microseconds because the whole engine runs on a
//! microsecond logical clock supplied by the caller.

use serde::{Deserialize, Serialize};
use slicesync_primitives::Name;

/// Microsecond instants and spans on the engine's logical clock.
pub type Micros = u64;

const MICROS_PER_SEC: u64 = 1_000_000;

/// Tunables for one engine instance, passed at construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Idle time before an unreachable cache entry is reclaimed.
    pub cache_purge_trigger: Micros,
    /// Max durability-queue entries handed to storage per cleaning pass.
    pub cache_clean_batch: usize,
    /// Spacing between cleaning passes.
    pub cache_clean_delta: Micros,
    /// Value `advise_need` is reset to when a RootAdvise becomes due.
    pub advise_need_reset: u32,
    /// Compare progress interval after which a stall warning is logged.
    pub update_stall_delta: Micros,
    /// Base delay between Updates on a busy root.
    pub update_need_delta: Micros,
    /// Quick-reschedule delay for cooperative yields.
    pub short_delay: Micros,
    /// Time without a successful fetch after which a Compare is abandoned.
    pub compare_assume_bad: Micros,
    /// Encoded-size threshold that triggers a node split, in bytes.
    pub node_split_trigger: usize,
    /// Byte budget for the RootAdvise exclusion list.
    pub exclusion_limit: usize,
    /// Quiet period before a stable point is committed.
    pub stable_time_trig: Micros,
    /// Hash-split threshold: split when the probe byte is below this (of 255).
    pub hash_split_trigger: u8,
    /// Names processed between yield checks.
    pub names_yield_inc: usize,
    /// Time budget per Update slice.
    pub names_yield_micros: Micros,
    /// Concurrent NodeFetch/ContentFetch budget per Compare.
    pub max_fetch_busy: usize,
    /// Concurrent Compares across all roots.
    pub max_compares_busy: usize,
    /// Lifetime of a RootAdvise interest; also the re-advise period.
    pub root_advise_lifetime: Micros,
    /// Freshness for RootAdvise response objects.
    pub root_advise_fresh: Micros,
    /// Lifetime of NodeFetch/ContentFetch interests.
    pub fetch_lifetime: Micros,
    /// Heartbeat period.
    pub heartbeat_micros: Micros,
    /// Probability (percent) of treating a good response as failed. Test
    /// hook; zero in production.
    pub faux_error_trigger: u8,
    /// Seed for the faux-error generator.
    pub faux_error_seed: u64,
    /// Debug bits controlling extra reporting.
    pub sync_action_flags: u32,
    /// Prefix for engine-local objects (stable point, slice announcements).
    pub local_host_prefix: Name,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_purge_trigger: 60 * MICROS_PER_SEC,
            cache_clean_batch: 16,
            cache_clean_delta: 8 * MICROS_PER_SEC,
            advise_need_reset: 1,
            update_stall_delta: 15 * MICROS_PER_SEC,
            update_need_delta: 6 * MICROS_PER_SEC,
            short_delay: 1_000,
            compare_assume_bad: 20 * MICROS_PER_SEC,
            node_split_trigger: 4000,
            exclusion_limit: 1000,
            stable_time_trig: 10 * MICROS_PER_SEC,
            hash_split_trigger: 17,
            names_yield_inc: 100,
            names_yield_micros: 20_000,
            max_fetch_busy: 4,
            max_compares_busy: 4,
            root_advise_lifetime: 20 * MICROS_PER_SEC,
            root_advise_fresh: 4 * MICROS_PER_SEC,
            fetch_lifetime: 4 * MICROS_PER_SEC,
            heartbeat_micros: 200_000,
            faux_error_trigger: 0,
            faux_error_seed: 0,
            sync_action_flags: 0,
            local_host_prefix: Name::from_segments(["localhost"]),
        }
    }
}

impl EngineConfig {
    /// Node-split high-water mark: splits are attempted once an accumulated
    /// run reaches 7/8 of the trigger.
    pub fn split_acc_limit(&self) -> usize {
        self.node_split_trigger - self.node_split_trigger / 8
    }

    /// Minimum accumulated bytes before a heuristic split is taken.
    pub fn split_acc_min(&self) -> usize {
        self.node_split_trigger / 2
    }

    #[must_use]
    pub fn with_heartbeat(mut self, micros: Micros) -> Self {
        self.heartbeat_micros = micros;
        self
    }

    #[must_use]
    pub fn with_local_host_prefix(mut self, prefix: Name) -> Self {
        self.local_host_prefix = prefix;
        self
    }

    #[must_use]
    pub fn with_faux_errors(mut self, percent: u8, seed: u64) -> Self {
        self.faux_error_trigger = percent;
        self.faux_error_seed = seed;
        self
    }
}
