//! Configuration for exchange_service_rust

use anyhow::{anyhow, Result};
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    // Network
    pub bind_addr: String,

    // Identity provider
    pub auth_secret: String,

    // Aggregator
    pub aggregate_interval_ms: u64,
    pub price_staleness_secs: u64,
    pub coingecko_poll_secs: u64,

    // Engine limits
    pub max_shares_per_order: i32,
    pub max_liquidity_per_call: i64,
    pub starting_balance_cents: i64,

    // Round lifecycle
    pub round_tick_ms: u64,

    // Gateway
    pub orderbook_debounce_ms: u64,

    // Monitoring
    pub heartbeat_interval_secs: u64,

    // Database. Matching is single-writer per round, so the pool mostly
    // serves gateway reads; a dozen connections covers a busy minute.
    pub database_url: String,
    pub db_max_connections: u32,
}

impl ExchangeConfig {
    pub fn from_env() -> Result<Self> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| anyhow!("DATABASE_URL must be set"))?;
        let auth_secret =
            env::var("AUTH_SECRET").map_err(|_| anyhow!("AUTH_SECRET must be set"))?;

        let max_shares_per_order = parse_env("MAX_SHARES_PER_ORDER", 1000i64)? as i32;
        let max_liquidity_per_call = parse_env("MAX_LIQUIDITY_PER_CALL", 10_000i64)?;
        let starting_balance_cents =
            (parse_env("STARTING_BALANCE", 1000.0f64)? * 100.0).round() as i64;
        let aggregate_interval_ms = parse_env("AGGREGATE_INTERVAL_MS", 1000u64)?;
        let round_tick_ms = parse_env("ROUND_TICK_MS", 500u64)?;
        let db_max_connections = parse_env("DB_MAX_CONNECTIONS", 12u32)?;

        // Validate limits
        if max_shares_per_order <= 0 {
            return Err(anyhow!("MAX_SHARES_PER_ORDER must be > 0"));
        }
        if max_liquidity_per_call <= 0 {
            return Err(anyhow!("MAX_LIQUIDITY_PER_CALL must be > 0"));
        }
        if starting_balance_cents < 0 {
            return Err(anyhow!("STARTING_BALANCE must be >= 0"));
        }
        if aggregate_interval_ms == 0 {
            return Err(anyhow!("AGGREGATE_INTERVAL_MS must be > 0"));
        }
        if round_tick_ms == 0 || round_tick_ms > 60_000 {
            return Err(anyhow!("ROUND_TICK_MS must be in (0, 60000]"));
        }
        if db_max_connections == 0 {
            return Err(anyhow!("DB_MAX_CONNECTIONS must be > 0"));
        }

        Ok(Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),

            auth_secret,

            aggregate_interval_ms,
            price_staleness_secs: parse_env("PRICE_STALENESS_SECS", 30u64)?,
            coingecko_poll_secs: parse_env("COINGECKO_POLL_SECS", 10u64)?,

            max_shares_per_order,
            max_liquidity_per_call,
            starting_balance_cents,

            round_tick_ms,

            orderbook_debounce_ms: parse_env("ORDERBOOK_DEBOUNCE_MS", 50u64)?,

            heartbeat_interval_secs: parse_env("HEARTBEAT_INTERVAL_SECS", 60u64)?,

            database_url,
            db_max_connections,
        })
    }
}

/// Read an env var as `T`, falling back to `default` when unset. An unset
/// variable is normal; a set-but-unparseable one is a configuration error
/// and aborts the boot.
fn parse_env<T: FromStr>(var_name: &str, default: T) -> Result<T> {
    match env::var(var_name) {
        Ok(val) => val.trim().parse().map_err(|_| {
            anyhow!(
                "{} must be a valid {}, got {:?}",
                var_name,
                std::any::type_name::<T>(),
                val
            )
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // from_env itself is not tested here: it reads the process environment,
    // which is shared across parallel tests. The tests below use var names
    // no other test touches.

    #[test]
    fn test_parse_env_default_when_unset() {
        assert_eq!(parse_env("UPDOWN_TEST_NEVER_SET", 7u64).unwrap(), 7);
        assert_eq!(parse_env("UPDOWN_TEST_NEVER_SET", 2.5f64).unwrap(), 2.5);
        assert_eq!(parse_env("UPDOWN_TEST_NEVER_SET", -3i64).unwrap(), -3);
    }

    #[test]
    fn test_parse_env_reads_and_trims() {
        env::set_var("UPDOWN_TEST_TRIMMED", " 250 ");
        assert_eq!(parse_env("UPDOWN_TEST_TRIMMED", 0u64).unwrap(), 250);
        env::remove_var("UPDOWN_TEST_TRIMMED");
    }

    #[test]
    fn test_parse_env_rejects_garbage() {
        env::set_var("UPDOWN_TEST_GARBAGE", "half a share");
        let err = parse_env("UPDOWN_TEST_GARBAGE", 1u32).unwrap_err();
        assert!(err.to_string().contains("UPDOWN_TEST_GARBAGE"));
        env::remove_var("UPDOWN_TEST_GARBAGE");
    }
}
