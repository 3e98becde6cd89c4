//! Wallet API endpoints

use crate::api::server::AppState;
use crate::services::WalletSummary;
use crate::types::normalize_wallet;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn is_address(wallet: &str) -> bool {
    wallet.len() == 42 && wallet.starts_with("0x") && wallet[2..].chars().all(|c| c.is_ascii_hexdigit())
}

/// Everything the detectors have cached for one wallet
pub async fn get_wallet(
    State(state): State<AppState>,
    Path(wallet): Path<String>,
) -> Result<Json<WalletSummary>, (StatusCode, Json<ErrorResponse>)> {
    let wallet = normalize_wallet(&wallet);
    if !is_address(&wallet) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("Invalid wallet address: {}", wallet),
            }),
        ));
    }
    Ok(Json(state.runner.wallet_summary(&wallet).await))
}
