//! In-memory markets table: one entry per minute, owned by the lifecycle
//! controller. All transitions are pure so they can be tested without a
//! clock or store.

use std::collections::HashMap;
use std::fmt;
use updown_rust_core::models::{Market, MarketOutcome, MarketPhase, ROUND_DURATION_MS};

/// Markets are pruned this long after they close.
pub const PRUNE_AFTER_MS: i64 = 10 * 60 * 1000;

/// How many future provision markets are kept ahead of the active one.
pub const PROVISION_LOOKAHEAD: i64 = 5;

#[derive(Debug, PartialEq, Eq)]
pub enum TableError {
    NotFound(i64),
    WrongPhase { round_start_ms: i64, phase: MarketPhase },
    /// A second market tried to activate while one is active.
    AlreadyActive { active_round_ms: i64 },
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableError::NotFound(ms) => write!(f, "market {} not found", ms),
            TableError::WrongPhase { round_start_ms, phase } => {
                write!(f, "market {} is {}", round_start_ms, phase.as_str())
            }
            TableError::AlreadyActive { active_round_ms } => {
                write!(f, "market {} is already active", active_round_ms)
            }
        }
    }
}

impl std::error::Error for TableError {}

#[derive(Debug, Default)]
pub struct RoundTable {
    markets: HashMap<i64, Market>,
    current_round_start: Option<i64>,
}

impl RoundTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the table at boot: the current minute plus the provisioning
    /// lookahead, all in `provision`. Returns the markets actually created
    /// (existing entries, e.g. recovered ones, are left untouched).
    pub fn seed(&mut self, now_ms: i64) -> Vec<Market> {
        let current = updown_rust_core::models::minute_start(now_ms);
        let mut created = Vec::new();

        for i in 0..=PROVISION_LOOKAHEAD {
            let start = current + i * ROUND_DURATION_MS;
            if !self.markets.contains_key(&start) {
                let market = Market::new_provision(start);
                self.markets.insert(start, market.clone());
                created.push(market);
            }
        }

        if self.current_round_start.is_none() {
            self.current_round_start = Some(current);
        }
        created
    }

    /// Re-insert a market that survived a restart.
    pub fn restore(&mut self, market: Market) {
        if market.phase == MarketPhase::Active {
            self.current_round_start = Some(market.minute_start_ms);
        }
        self.markets.insert(market.minute_start_ms, market);
    }

    pub fn current_round_start(&self) -> Option<i64> {
        self.current_round_start
    }

    pub fn set_current_round_start(&mut self, round_start_ms: i64) {
        self.current_round_start = Some(round_start_ms);
    }

    pub fn market(&self, round_start_ms: i64) -> Option<&Market> {
        self.markets.get(&round_start_ms)
    }

    pub fn market_by_slug(&self, slug: &str) -> Option<&Market> {
        self.markets.values().find(|m| m.slug == slug)
    }

    pub fn active_market(&self) -> Option<&Market> {
        self.markets.values().find(|m| m.phase == MarketPhase::Active)
    }

    /// All markets ordered by minute start.
    pub fn market_list(&self) -> Vec<Market> {
        let mut list: Vec<Market> = self.markets.values().cloned().collect();
        list.sort_by_key(|m| m.minute_start_ms);
        list
    }

    /// Move a provisioning market to `active`, fixing its price to beat.
    /// The single-active invariant is enforced here: a violation is an
    /// internal error, never a user-visible demotion.
    pub fn activate(
        &mut self,
        round_start_ms: i64,
        price_to_beat: f64,
    ) -> Result<Market, TableError> {
        if let Some(active) = self.active_market() {
            if active.minute_start_ms != round_start_ms {
                return Err(TableError::AlreadyActive {
                    active_round_ms: active.minute_start_ms,
                });
            }
        }

        let market = self
            .markets
            .get_mut(&round_start_ms)
            .ok_or(TableError::NotFound(round_start_ms))?;

        match market.phase {
            MarketPhase::Provision => {
                market.phase = MarketPhase::Active;
                market.price_to_beat = Some(price_to_beat);
                Ok(market.clone())
            }
            phase => Err(TableError::WrongPhase { round_start_ms, phase }),
        }
    }

    /// Close a market against the final reference price. The outcome is
    /// `up` iff `finalPrice >= priceToBeat`; a market that never activated
    /// closes with no outcome.
    pub fn settle(&mut self, round_start_ms: i64, final_price: f64) -> Result<Market, TableError> {
        let market = self
            .markets
            .get_mut(&round_start_ms)
            .ok_or(TableError::NotFound(round_start_ms))?;

        if market.phase == MarketPhase::Closed {
            return Err(TableError::WrongPhase {
                round_start_ms,
                phase: MarketPhase::Closed,
            });
        }

        market.final_price = Some(final_price);
        market.outcome = market.price_to_beat.map(|ptb| {
            if final_price >= ptb {
                MarketOutcome::Up
            } else {
                MarketOutcome::Down
            }
        });
        market.phase = MarketPhase::Closed;
        Ok(market.clone())
    }

    /// Add a future provisioning market if it does not exist yet.
    pub fn create_provision(&mut self, round_start_ms: i64) -> Option<Market> {
        if self.markets.contains_key(&round_start_ms) {
            return None;
        }
        let market = Market::new_provision(round_start_ms);
        self.markets.insert(round_start_ms, market.clone());
        Some(market)
    }

    /// Drop markets whose close is more than the prune window in the past.
    /// Returns the removed round starts.
    pub fn prune(&mut self, now_ms: i64) -> Vec<i64> {
        let cutoff = now_ms - PRUNE_AFTER_MS;
        let removed: Vec<i64> = self
            .markets
            .values()
            .filter(|m| m.close_ms() < cutoff)
            .map(|m| m.minute_start_ms)
            .collect();
        for round in &removed {
            self.markets.remove(round);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.markets.len()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: i64 = ROUND_DURATION_MS;

    #[test]
    fn test_seed_creates_current_plus_lookahead() {
        let mut table = RoundTable::new();
        let created = table.seed(10 * MIN + 1234);

        assert_eq!(created.len(), 6);
        assert_eq!(table.current_round_start(), Some(10 * MIN));
        assert!(table.market(10 * MIN).is_some());
        assert!(table.market(15 * MIN).is_some());
        assert!(table.market(16 * MIN).is_none());
        assert!(table.active_market().is_none());
    }

    #[test]
    fn test_activate_sets_price_to_beat_once() {
        let mut table = RoundTable::new();
        table.seed(10 * MIN);

        let market = table.activate(10 * MIN, 65000.0).unwrap();
        assert_eq!(market.phase, MarketPhase::Active);
        assert_eq!(market.price_to_beat, Some(65000.0));

        // A second activation of the same market is a phase error
        let err = table.activate(10 * MIN, 66000.0).unwrap_err();
        assert!(matches!(err, TableError::WrongPhase { .. }));
        assert_eq!(table.market(10 * MIN).unwrap().price_to_beat, Some(65000.0));
    }

    #[test]
    fn test_single_active_invariant() {
        let mut table = RoundTable::new();
        table.seed(10 * MIN);
        table.activate(10 * MIN, 65000.0).unwrap();

        let err = table.activate(11 * MIN, 65000.0).unwrap_err();
        assert_eq!(err, TableError::AlreadyActive { active_round_ms: 10 * MIN });
    }

    #[test]
    fn test_settle_outcome_up_down_and_tie() {
        let mut table = RoundTable::new();
        table.seed(10 * MIN);

        table.activate(10 * MIN, 65000.0).unwrap();
        let settled = table.settle(10 * MIN, 65100.0).unwrap();
        assert_eq!(settled.phase, MarketPhase::Closed);
        assert_eq!(settled.outcome, Some(MarketOutcome::Up));

        table.activate(11 * MIN, 65100.0).unwrap();
        let settled = table.settle(11 * MIN, 65000.0).unwrap();
        assert_eq!(settled.outcome, Some(MarketOutcome::Down));

        // final == priceToBeat resolves up
        table.activate(12 * MIN, 65000.0).unwrap();
        let settled = table.settle(12 * MIN, 65000.0).unwrap();
        assert_eq!(settled.outcome, Some(MarketOutcome::Up));
    }

    #[test]
    fn test_settle_never_activated_has_no_outcome() {
        let mut table = RoundTable::new();
        table.seed(10 * MIN);

        let settled = table.settle(10 * MIN, 65000.0).unwrap();
        assert_eq!(settled.phase, MarketPhase::Closed);
        assert_eq!(settled.outcome, None);
        assert_eq!(settled.final_price, Some(65000.0));
    }

    #[test]
    fn test_lifecycle_continuity() {
        // Close-of-previous becomes open-of-next
        let mut table = RoundTable::new();
        table.seed(10 * MIN);
        table.activate(10 * MIN, 65000.0).unwrap();

        let final_price = 65432.1;
        let settled = table.settle(10 * MIN, final_price).unwrap();
        let next = table.activate(11 * MIN, settled.final_price.unwrap()).unwrap();
        assert_eq!(next.price_to_beat, Some(final_price));
    }

    #[test]
    fn test_prune_removes_old_closed_markets() {
        let mut table = RoundTable::new();
        table.seed(10 * MIN);
        table.activate(10 * MIN, 65000.0).unwrap();
        table.settle(10 * MIN, 65100.0).unwrap();

        // Just before the prune window nothing happens
        let not_yet = 11 * MIN + PRUNE_AFTER_MS - 1;
        assert!(table.prune(not_yet).is_empty());

        let removed = table.prune(11 * MIN + PRUNE_AFTER_MS + 1);
        assert_eq!(removed, vec![10 * MIN]);
        assert!(table.market(10 * MIN).is_none());
    }

    #[test]
    fn test_market_by_slug() {
        let mut table = RoundTable::new();
        table.seed(10 * MIN);
        let slug = table.market(10 * MIN).unwrap().slug.clone();
        assert_eq!(
            table.market_by_slug(&slug).unwrap().minute_start_ms,
            10 * MIN
        );
        assert!(table.market_by_slug("btc-19700101-9999").is_none());
    }

    #[test]
    fn test_create_provision_is_idempotent() {
        let mut table = RoundTable::new();
        table.seed(10 * MIN);
        assert!(table.create_provision(16 * MIN).is_some());
        assert!(table.create_provision(16 * MIN).is_none());
    }
}
