//! Protocol timing constants and randomized election intervals.

use rand::rngs::StdRng;
use rand::Rng;
use tokio::time::Duration;

/// The global tick divides one second into sixteen slots.
pub const TICK_INTERVAL: Duration = Duration::from_micros(62_500);

/// Per-peer throttle on reconciliation traffic, half a tick.
pub const REPLICATION_THROTTLE: Duration = Duration::from_micros(31_250);

/// How long a leader tolerates silence on a link before re-sending an
/// empty AppendEntries to wake the exchange up.
pub const PEER_PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// Sample a fresh election interval base, `1s + rand(0..7s)`.
pub fn rand_delta(rng: &mut StdRng) -> Duration {
    Duration::from_secs(1) + rng.gen_range(Duration::ZERO..Duration::from_secs(7))
}

/// Grace period before a freshly constructed node may start its first
/// election, `1s + rand(0..5s)`.
pub fn initial_delta(rng: &mut StdRng) -> Duration {
    Duration::from_secs(1) + rng.gen_range(Duration::ZERO..Duration::from_secs(5))
}

/// Random deadline extension applied when traffic arrives at the current
/// term, up to half a second.
pub fn deadline_nudge(rng: &mut StdRng) -> Duration {
    rng.gen_range(Duration::ZERO..Duration::from_secs(2)) / 4
}
