//! REST API server for the ledger transfer engine.
//!
//! Run with: `cargo run --example server`
//!
//! The caller is identified by the `x-user-id` header, standing in for a
//! real authentication layer.
//!
//! ## Endpoints
//!
//! - `POST /wallets` - Open a wallet for the caller in a currency
//! - `GET /wallets` - The caller's balances
//! - `POST /transfers` - Move funds between wallets
//! - `POST /payouts` - Bulk payout from the caller's (business) wallets
//! - `POST /webhooks/paystack` - Signed payment gateway funding events
//!
//! ## Example Usage
//!
//! ```bash
//! # Open wallets
//! curl -X POST http://localhost:3000/wallets -H "x-user-id: kofi" \
//!   -H "Content-Type: application/json" -d '{"currency": "GHS"}'
//! curl -X POST http://localhost:3000/wallets -H "x-user-id: ada" \
//!   -H "Content-Type: application/json" -d '{"currency": "NGN"}'
//!
//! # Transfer (wallet ids from the responses above)
//! curl -X POST http://localhost:3000/transfers -H "x-user-id: ada" \
//!   -H "Idempotency-Key: send-1" -H "Content-Type: application/json" \
//!   -d '{"source_wallet_id": "...", "destination_wallet_id": "...", "amount": "1000"}'
//!
//! # Balances
//! curl http://localhost:3000/wallets -H "x-user-id: kofi"
//! ```

use axum::{
    Json, Router,
    body::Bytes,
    extract::{FromRequestParts, State},
    http::{HeaderMap, StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::post,
};
use remit_ledger::funding::{self, GatewayEvent};
use remit_ledger::{
    CurrencyCode, EngineConfig, IdempotencyKey, PayoutItem, PayoutOutcome, RateProvider,
    StaticRates, TransferEngine, TransferError, TransferRequest, TransferResult, UserId,
    WalletBalance, WalletSnapshot,
};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

// === Request/Response DTOs ===

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OpenWalletRequest {
    pub currency: CurrencyCode,
}

/// ```json
/// {"batch_key": "march-salaries", "payouts": [{"recipient": "kofi", "amount": "50", "currency": "GHS"}]}
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PayoutRequest {
    #[serde(default)]
    pub batch_key: Option<String>,
    pub payouts: Vec<PayoutItem>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PayoutResponse {
    pub message: String,
    pub results: Vec<PayoutOutcome>,
}

/// Response body for errors.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn error_response(status: StatusCode, error: &str, code: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

// === Application State ===

/// Shared application state containing the transfer engine.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<TransferEngine>,
    /// Gateway secret used to verify webhook signatures.
    pub webhook_secret: Arc<str>,
}

// === Authentication ===

pub const USER_HEADER: &str = "x-user-id";
pub const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// Authenticated caller.
pub struct Caller(pub UserId);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|user| !user.is_empty())
            .map(|user| Caller(UserId::new(user)))
            .ok_or_else(|| {
                error_response(
                    StatusCode::UNAUTHORIZED,
                    "missing caller identity",
                    "UNAUTHENTICATED",
                )
            })
    }
}

// === Error Handling ===

/// Status code for a transfer failure.
pub fn status_for(err: &TransferError) -> StatusCode {
    match err {
        TransferError::InvalidAmount
        | TransferError::SelfTransfer
        | TransferError::EmptyBatch => StatusCode::BAD_REQUEST,
        TransferError::PermissionDenied => StatusCode::FORBIDDEN,
        TransferError::RecipientWalletNotFound => StatusCode::NOT_FOUND,
        TransferError::InsufficientFunds => StatusCode::UNPROCESSABLE_ENTITY,
        TransferError::TransferInProgress
        | TransferError::IdempotencyKeyReused
        | TransferError::ConcurrentModification => StatusCode::CONFLICT,
        TransferError::RateUnavailable { .. } | TransferError::StorageUnavailable => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

/// Wrapper for converting `TransferError` into HTTP responses.
pub struct AppError(TransferError);

impl From<TransferError> for AppError {
    fn from(err: TransferError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error_response(status_for(&self.0), &self.0.to_string(), self.0.code())
    }
}

// === Handlers ===

/// POST /wallets - Open (or fetch) the caller's wallet in a currency.
async fn open_wallet(
    State(state): State<AppState>,
    Caller(user): Caller,
    Json(request): Json<OpenWalletRequest>,
) -> (StatusCode, Json<WalletSnapshot>) {
    let wallet = state.engine.open_wallet(&user, request.currency);
    (StatusCode::CREATED, Json(wallet))
}

/// GET /wallets - The caller's balances.
async fn list_wallets(
    State(state): State<AppState>,
    Caller(user): Caller,
) -> Json<Vec<WalletBalance>> {
    Json(state.engine.wallet_balances(&user))
}

/// POST /transfers - Move funds on behalf of the caller.
///
/// An `Idempotency-Key` header takes precedence over a key in the body.
async fn create_transfer(
    State(state): State<AppState>,
    Caller(user): Caller,
    headers: HeaderMap,
    Json(mut request): Json<TransferRequest>,
) -> (StatusCode, Json<TransferResult>) {
    if let Some(key) = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        request.idempotency_key = Some(IdempotencyKey::new(key));
    }

    let result = state.engine.transfer(&user, request).await;
    let status = match &result {
        Ok(_) => StatusCode::CREATED,
        Err(err) => status_for(err),
    };
    (status, Json(TransferResult::from(result)))
}

/// POST /payouts - Bulk payout from the caller's wallets.
async fn create_payouts(
    State(state): State<AppState>,
    Caller(business): Caller,
    Json(request): Json<PayoutRequest>,
) -> Result<Json<PayoutResponse>, AppError> {
    let results = state
        .engine
        .payout_batch(&business, &request.payouts, request.batch_key.as_deref())
        .await?;
    Ok(Json(PayoutResponse {
        message: "bulk payout processing complete".to_string(),
        results,
    }))
}

/// POST /webhooks/paystack - Credit a verified `charge.success` event.
///
/// The customer email is used as the user id.
async fn paystack_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(signature) = headers
        .get(funding::SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        return error_response(StatusCode::UNAUTHORIZED, "missing signature", "INVALID_SIGNATURE");
    };
    if let Err(err) = funding::verify_signature(&state.webhook_secret, &body, signature) {
        warn!(error = %err, "rejected webhook");
        return error_response(StatusCode::UNAUTHORIZED, "invalid signature", "INVALID_SIGNATURE");
    }

    let charge = match GatewayEvent::parse(&body) {
        Ok(GatewayEvent::ChargeSuccess(charge)) => charge,
        Ok(GatewayEvent::Ignored(event)) => {
            info!(%event, "ignoring gateway event");
            return StatusCode::OK.into_response();
        }
        Err(err) => {
            return error_response(StatusCode::BAD_REQUEST, &err.to_string(), "MALFORMED_EVENT");
        }
    };

    let user = UserId::new(charge.customer_email.to_lowercase());
    match state.engine.credit_funding(charge.into_credit(user)) {
        Ok(receipt) => (StatusCode::OK, Json(TransferResult::from(Ok(receipt)))).into_response(),
        Err(err) => AppError(err).into_response(),
    }
}

// === Router ===

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/wallets", post(open_wallet).get(list_wallets))
        .route("/transfers", post(create_transfer))
        .route("/payouts", post(create_payouts))
        .route("/webhooks/paystack", post(paystack_webhook))
        .with_state(state)
}

// === Main ===

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let provider: Arc<dyn RateProvider> = match std::env::var("FX_API_KEY") {
        Ok(key) => Arc::new(EngineConfig::default().exchange_rate_api(key)?),
        Err(_) => {
            let ngn: CurrencyCode = "NGN".parse()?;
            let ghs: CurrencyCode = "GHS".parse()?;
            Arc::new(
                StaticRates::new()
                    .with_rate(ngn, ghs, dec!(0.0075))
                    .with_rate(ghs, ngn, dec!(133.3333)),
            )
        }
    };
    let webhook_secret =
        std::env::var("PAYSTACK_SECRET_KEY").unwrap_or_else(|_| "sk_test_demo".to_string());

    let state = AppState {
        engine: Arc::new(TransferEngine::new(provider)),
        webhook_secret: webhook_secret.into(),
    };

    let app = create_router(state);

    let listener = TcpListener::bind("127.0.0.1:3000").await?;
    println!("Remit ledger API server running on http://127.0.0.1:3000");
    println!();
    println!("Endpoints:");
    println!("  POST /wallets            - Open a wallet");
    println!("  GET  /wallets            - Caller balances");
    println!("  POST /transfers          - Transfer funds");
    println!("  POST /payouts            - Bulk payout");
    println!("  POST /webhooks/paystack  - Gateway funding webhook");

    axum::serve(listener, app).await?;
    Ok(())
}
