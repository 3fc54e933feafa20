use chrono::{DateTime, Utc};

/// Estimated block height at `at`, given the latest height observed `now`.
///
/// Nearest-not-after: the distance is rounded *up* in blocks, so the
/// estimate errs toward an earlier block rather than one after `at`. This is
/// an approximation; exact snapshotting would need a block-by-timestamp
/// index, which can be injected later without changing the fetcher contract.
pub fn estimate_block_before(
    latest: u64,
    now: DateTime<Utc>,
    at: DateTime<Utc>,
    avg_block_time_secs: f64,
) -> u64 {
    if at >= now {
        return latest;
    }
    let delta_secs = (now - at).num_seconds().max(0) as f64;
    let behind = (delta_secs / avg_block_time_secs).ceil() as u64;
    latest.saturating_sub(behind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn future_or_present_instants_pin_to_latest() {
        let now = Utc::now();
        assert_eq!(estimate_block_before(1000, now, now, 12.0), 1000);
        assert_eq!(estimate_block_before(1000, now, now + Duration::minutes(1), 12.0), 1000);
    }

    #[test]
    fn past_instants_walk_back_by_average_block_time() {
        let now = Utc::now();
        let hour_ago = now - Duration::hours(1);
        // 3600s / 12s per block = 300 blocks.
        assert_eq!(estimate_block_before(10_000, now, hour_ago, 12.0), 9_700);
        // 3600s / 2s per block = 1800 blocks.
        assert_eq!(estimate_block_before(10_000, now, hour_ago, 2.0), 8_200);
    }

    #[test]
    fn partial_blocks_round_toward_the_past() {
        let now = Utc::now();
        let at = now - Duration::seconds(13);
        // 13s / 12s = 1.08 blocks, rounded up to 2.
        assert_eq!(estimate_block_before(100, now, at, 12.0), 98);
    }

    #[test]
    fn estimates_clamp_at_genesis() {
        let now = Utc::now();
        let long_ago = now - Duration::days(365);
        assert_eq!(estimate_block_before(10, now, long_ago, 2.0), 0);
    }
}
