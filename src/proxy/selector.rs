//! Proxy host selection

use crate::config::SelectPolicy;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;

/// Hosts at or under this latency always count as "similar"
pub const SIMILAR_LATENCY_FLOOR: Duration = Duration::from_millis(200);

/// Pick a host according to `policy`.
///
/// `ranked` holds reachable hosts in ascending latency order; when it is
/// empty the static `hosts` list is used instead.
pub fn select<'a, R: Rng + ?Sized>(
    policy: SelectPolicy,
    ranked: &'a [String],
    latencies: &HashMap<String, Duration>,
    hosts: &'a [String],
    rng: &mut R,
) -> Option<&'a str> {
    let active = if ranked.is_empty() { hosts } else { ranked };

    let picked = match policy {
        SelectPolicy::Random => active.choose(rng),
        SelectPolicy::Latency => active.first(),
        SelectPolicy::RandomOnSimilarLowestLatency if ranked.is_empty() => active.choose(rng),
        SelectPolicy::RandomOnSimilarLowestLatency => {
            let similar = similar_prefix(ranked, latencies);
            ranked[..similar].choose(rng)
        }
    };
    picked.map(String::as_str)
}

/// Length of the ranked prefix within reach of the minimum latency
fn similar_prefix(ranked: &[String], latencies: &HashMap<String, Duration>) -> usize {
    let latency_of = |host: &String| latencies.get(host).copied().unwrap_or(Duration::MAX);

    let min = match ranked.iter().map(latency_of).min() {
        Some(min) => min,
        None => return 0,
    };
    let relative = min.saturating_add(min / 2);

    ranked
        .iter()
        .take_while(|host| {
            let latency = latency_of(host);
            latency <= SIMILAR_LATENCY_FLOOR || latency <= relative
        })
        .count()
        .max(1)
}
