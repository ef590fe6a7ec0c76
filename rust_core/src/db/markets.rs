//! Market rows (`btc_1m_outcomes`): one per minute, unique by both
//! `minute_start_ms` and `slug`.

use crate::models::{Market, MarketOutcome, MarketPhase};
use anyhow::{Context, Result};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};

impl<'r> FromRow<'r, PgRow> for Market {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        let phase_s: String = row.try_get("phase")?;
        let outcome_s: Option<String> = row.try_get("outcome")?;

        let phase = MarketPhase::parse(&phase_s)
            .ok_or_else(|| sqlx::Error::Decode(format!("invalid phase: {}", phase_s).into()))?;
        let outcome = match outcome_s {
            Some(s) => Some(
                MarketOutcome::parse(&s)
                    .ok_or_else(|| sqlx::Error::Decode(format!("invalid outcome: {}", s).into()))?,
            ),
            None => None,
        };

        Ok(Market {
            minute_start_ms: row.try_get("minute_start_ms")?,
            slug: row.try_get("slug")?,
            phase,
            price_to_beat: row.try_get("price_to_beat")?,
            final_price: row.try_get("final_price")?,
            outcome,
        })
    }
}

/// Persist the market's current lifecycle state.
pub async fn upsert_market(pool: &PgPool, market: &Market) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO btc_1m_outcomes (
            minute_start_ms, slug, phase, price_to_beat, final_price, outcome
        ) VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (minute_start_ms) DO UPDATE SET
            phase = EXCLUDED.phase,
            price_to_beat = EXCLUDED.price_to_beat,
            final_price = EXCLUDED.final_price,
            outcome = EXCLUDED.outcome
        "#,
    )
    .bind(market.minute_start_ms)
    .bind(&market.slug)
    .bind(market.phase.as_str())
    .bind(market.price_to_beat)
    .bind(market.final_price)
    .bind(market.outcome.map(|o| o.as_str()))
    .execute(pool)
    .await
    .context("Failed to upsert market")?;

    Ok(())
}

/// Store fallback for markets aged out of the in-memory table.
pub async fn get_market_by_slug(pool: &PgPool, slug: &str) -> Result<Option<Market>> {
    let market: Option<Market> = sqlx::query_as(
        r#"
        SELECT minute_start_ms, slug, phase, price_to_beat, final_price, outcome
        FROM btc_1m_outcomes
        WHERE slug = $1
        "#,
    )
    .bind(slug)
    .fetch_optional(pool)
    .await
    .context("Failed to fetch market by slug")?;

    Ok(market)
}

/// Recently settled markets, newest first.
pub async fn get_recent_outcomes(pool: &PgPool, limit: i64) -> Result<Vec<Market>> {
    let markets: Vec<Market> = sqlx::query_as(
        r#"
        SELECT minute_start_ms, slug, phase, price_to_beat, final_price, outcome
        FROM btc_1m_outcomes
        WHERE phase = 'closed' AND outcome IS NOT NULL
        ORDER BY minute_start_ms DESC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("Failed to fetch recent outcomes")?;

    Ok(markets)
}

/// Markets that were not yet closed at the moment of a restart; used to
/// reload engine state.
pub async fn get_unclosed_markets(pool: &PgPool) -> Result<Vec<Market>> {
    let markets: Vec<Market> = sqlx::query_as(
        r#"
        SELECT minute_start_ms, slug, phase, price_to_beat, final_price, outcome
        FROM btc_1m_outcomes
        WHERE phase != 'closed'
        ORDER BY minute_start_ms ASC
        "#,
    )
    .fetch_all(pool)
    .await
    .context("Failed to fetch unclosed markets")?;

    Ok(markets)
}
