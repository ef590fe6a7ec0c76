//! HTTP surface and WebSocket upgrade.
//!
//! The static trading UI and SPA routes are served elsewhere; this router
//! carries only the JSON API and the `/ws` upgrade.

use crate::gateway::messages::UserInfo;
use crate::gateway::session::handle_socket;
use crate::AppState;
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use log::{error, info};
use serde::{Deserialize, Serialize};
use serde_json::json;
use updown_rust_core::auth::IdentityClaim;
use updown_rust_core::db::{markets, prices, users};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/history", get(get_history))
        .route("/api/outcomes", get(get_outcomes))
        .route("/api/markets", get(get_markets))
        .route("/api/market/:slug", get(get_market))
        .route("/api/auth/telegram", post(auth_telegram))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct LimitParams {
    limit: Option<i64>,
}

async fn get_history(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(100).clamp(1, 500);
    match prices::get_price_history(&state.pool, limit).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => {
            error!("History query failed: {}", e);
            internal_error()
        }
    }
}

async fn get_outcomes(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(10).clamp(1, 50);
    match markets::get_recent_outcomes(&state.pool, limit).await {
        Ok(rows) => Json(rows).into_response(),
        Err(e) => {
            error!("Outcomes query failed: {}", e);
            internal_error()
        }
    }
}

async fn get_markets(State(state): State<AppState>) -> impl IntoResponse {
    let markets = state.table.read().await.market_list();
    Json(markets)
}

async fn get_market(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> impl IntoResponse {
    if let Some(market) = state.table.read().await.market_by_slug(&slug) {
        return Json(market.clone()).into_response();
    }
    match markets::get_market_by_slug(&state.pool, &slug).await {
        Ok(Some(market)) => Json(market).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Market not found"})),
        )
            .into_response(),
        Err(e) => {
            error!("Market query failed: {}", e);
            internal_error()
        }
    }
}

#[derive(Debug, Serialize)]
struct AuthResponse {
    user: UserInfo,
    token: String,
}

async fn auth_telegram(
    State(state): State<AppState>,
    Json(claim): Json<IdentityClaim>,
) -> impl IntoResponse {
    if let Err(e) = state.verifier.verify_claim(&claim, Utc::now().timestamp()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": e.to_string()})),
        )
            .into_response();
    }

    let user = match users::upsert_user(
        &state.pool,
        claim.id,
        claim.username.as_deref(),
        &claim.first_name,
        state.config.starting_balance_cents,
    )
    .await
    {
        Ok(user) => user,
        Err(e) => {
            error!("User upsert failed: {}", e);
            return internal_error();
        }
    };

    info!("User {} authenticated", user.user_id);
    let token = state.verifier.session_token(claim.id, claim.auth_date);
    Json(AuthResponse {
        user: UserInfo::from(&user),
        token,
    })
    .into_response()
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn internal_error() -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "Internal error"})),
    )
        .into_response()
}
