use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use crate::util::now_ms;

/// Per-outcome recent activity used to pick a market's dominant outcome.
#[derive(Debug, Default, Clone)]
pub struct OutcomeActivity {
    pub volume: f64,
    pub trades: u64,
}

/// Pick the dominant outcome from a recent volume distribution: highest
/// volume wins, trade count breaks ties.
pub fn pick_dominant(by_outcome: &HashMap<String, OutcomeActivity>) -> Option<String> {
    by_outcome
        .iter()
        .filter(|(_, a)| a.trades > 0)
        .max_by(|(_, a), (_, b)| {
            a.volume
                .partial_cmp(&b.volume)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.trades.cmp(&b.trades))
        })
        .map(|(label, _)| label.clone())
}

/// TTL cache of dominant outcomes. A stale entry reads as `None`, so the
/// stream predicate then passes everything through rather than filtering on
/// an outdated answer.
pub struct DominantOutcomeCache {
    ttl_ms: i64,
    entries: DashMap<String, (String, i64)>,
}

impl DominantOutcomeCache {
    pub fn new(ttl_ms: i64) -> Arc<Self> {
        Arc::new(Self {
            ttl_ms,
            entries: DashMap::new(),
        })
    }

    pub fn set(&self, market_id: &str, outcome: String) {
        self.entries
            .insert(market_id.to_string(), (outcome, now_ms()));
    }

    pub fn get(&self, market_id: &str) -> Option<String> {
        self.get_at(market_id, now_ms())
    }

    pub fn get_at(&self, market_id: &str, now: i64) -> Option<String> {
        let entry = self.entries.get(market_id)?;
        let (outcome, set_at) = entry.value();
        if now - set_at >= self.ttl_ms {
            return None;
        }
        Some(outcome.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dominant_is_highest_volume() {
        let mut m = HashMap::new();
        m.insert("Yes".to_string(), OutcomeActivity { volume: 1000.0, trades: 20 });
        m.insert("No".to_string(), OutcomeActivity { volume: 120.0, trades: 5 });
        assert_eq!(pick_dominant(&m), Some("Yes".to_string()));
    }

    #[test]
    fn trade_count_breaks_volume_ties() {
        let mut m = HashMap::new();
        m.insert("Up".to_string(), OutcomeActivity { volume: 100.0, trades: 3 });
        m.insert("Down".to_string(), OutcomeActivity { volume: 100.0, trades: 9 });
        assert_eq!(pick_dominant(&m), Some("Down".to_string()));
    }

    #[test]
    fn no_trades_means_no_dominant() {
        let mut m = HashMap::new();
        m.insert("Yes".to_string(), OutcomeActivity { volume: 0.0, trades: 0 });
        assert_eq!(pick_dominant(&m), None);
    }

    #[test]
    fn stale_entry_reads_as_none() {
        let cache = DominantOutcomeCache::new(1_000);
        cache.set("m1", "Yes".to_string());
        let set_at = now_ms();
        assert_eq!(cache.get_at("m1", set_at + 500), Some("Yes".to_string()));
        assert_eq!(cache.get_at("m1", set_at + 1_001), None);
    }
}
