// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.
use clap::{Parser, ValueEnum};
use csv::{ReaderBuilder, Trim, Writer};
use remit_ledger::{
    CurrencyCode, EngineConfig, FundingCredit, RateProvider, StaticRates, TransferEngine,
    TransferRequest, UserId,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Remit Ledger - Replay wallet operations through the transfer engine
///
/// Reads operations from a CSV file and writes wallet balances to stdout.
/// Supports wallet opening, gateway funding, and (cross-currency) transfers.
#[derive(Parser, Debug)]
#[command(name = "remit-ledger")]
#[command(
    about = "Replays wallet operations through the ledger transfer engine",
    long_about = None
)]
struct Args {
    /// Path to CSV file with operations
    ///
    /// Expected format: type,user,currency,recipient,recipient_currency,amount,reference
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// CSV file of conversion rates: source,target,rate
    #[arg(long, value_name = "FILE")]
    rates: Option<PathBuf>,

    /// ExchangeRate-API key; when set, rates are fetched live
    #[arg(long, env = "FX_API_KEY", hide_env_values = true)]
    fx_api_key: Option<String>,

    /// Also write every journal record as CSV to this file
    #[arg(long, value_name = "FILE")]
    journal: Option<PathBuf>,

    /// Seconds a cached conversion rate stays fresh
    #[arg(long, env = "LEDGER_RATE_TTL_SECS", default_value_t = 300)]
    rate_ttl_secs: u64,

    /// Bounded wait for each wallet lock, in milliseconds
    #[arg(long, env = "LEDGER_LOCK_TIMEOUT_MS", default_value_t = 250)]
    lock_timeout_ms: u64,

    /// Attempts on wallet lock contention before giving up
    #[arg(long, env = "LEDGER_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Request timeout for live rate lookups, in seconds
    #[arg(long, env = "LEDGER_FX_TIMEOUT_SECS", default_value_t = 10)]
    fx_timeout_secs: u64,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

impl Args {
    fn config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_rate_ttl(Duration::from_secs(self.rate_ttl_secs))
            .with_lock_timeout(Duration::from_millis(self.lock_timeout_ms))
            .with_max_retries(self.max_retries)
            .with_rate_fetch_timeout(Duration::from_secs(self.fx_timeout_secs))
    }
}

/// Logs go to stderr; stdout carries the balance CSV.
fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.log_format);

    let config = args.config();
    let provider: Arc<dyn RateProvider> = match (&args.fx_api_key, &args.rates) {
        (Some(key), _) => match config.exchange_rate_api(key.clone()) {
            Ok(api) => Arc::new(api),
            Err(e) => {
                eprintln!("Error creating rate client: {}", e);
                process::exit(1);
            }
        },
        (None, Some(path)) => {
            match File::open(path).map_err(csv::Error::from).and_then(load_rates) {
                Ok(rates) => Arc::new(rates),
                Err(e) => {
                    eprintln!("Error reading rates '{}': {}", path.display(), e);
                    process::exit(1);
                }
            }
        }
        (None, None) => Arc::new(StaticRates::new()),
    };
    let engine = TransferEngine::with_config(provider, config);

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening file '{}': {}", args.input.display(), e);
            process::exit(1);
        }
    };

    if let Err(e) = process_operations(&engine, BufReader::new(file)).await {
        eprintln!("Error processing operations: {}", e);
        process::exit(1);
    }

    if let Err(e) = write_wallets(&engine, std::io::stdout()) {
        eprintln!("Error writing output: {}", e);
        process::exit(1);
    }

    if let Some(path) = &args.journal {
        let result = File::create(path)
            .map_err(csv::Error::from)
            .and_then(|file| write_journal(&engine, file));
        if let Err(e) = result {
            eprintln!("Error writing journal '{}': {}", path.display(), e);
            process::exit(1);
        }
    }
}

#[derive(Debug, Deserialize)]
struct RateRecord {
    source: CurrencyCode,
    target: CurrencyCode,
    rate: Decimal,
}

/// Loads a `source,target,rate` table. Malformed rows are skipped.
fn load_rates<R: Read>(reader: R) -> Result<StaticRates, csv::Error> {
    let mut rates = StaticRates::new();
    let mut rdr = ReaderBuilder::new().trim(Trim::All).from_reader(reader);
    for result in rdr.deserialize::<RateRecord>() {
        match result {
            Ok(record) => rates.insert(record.source, record.target, record.rate),
            Err(e) => warn!(error = %e, "skipping malformed rate row"),
        }
    }
    Ok(rates)
}

/// Raw CSV record matching the input format.
#[derive(Debug, Deserialize)]
struct CsvRecord {
    #[serde(rename = "type")]
    op: String,
    user: String,
    currency: CurrencyCode,
    #[serde(default)]
    recipient: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    recipient_currency: Option<CurrencyCode>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    amount: Option<Decimal>,
    #[serde(default)]
    reference: Option<String>,
}

#[derive(Debug)]
enum Operation {
    Open {
        user: UserId,
        currency: CurrencyCode,
    },
    Fund(FundingCredit),
    Transfer {
        user: UserId,
        currency: CurrencyCode,
        recipient: UserId,
        recipient_currency: CurrencyCode,
        amount: Decimal,
        reference: Option<String>,
    },
}

impl CsvRecord {
    /// Returns `None` for unknown operation types or missing required fields.
    fn into_operation(self) -> Option<Operation> {
        let user = UserId::new(self.user);
        match self.op.to_lowercase().as_str() {
            "open" => Some(Operation::Open {
                user,
                currency: self.currency,
            }),
            "fund" => Some(Operation::Fund(FundingCredit {
                user,
                currency: self.currency,
                amount: self.amount?,
                reference: self.reference?,
            })),
            "transfer" => Some(Operation::Transfer {
                user,
                currency: self.currency,
                recipient: UserId::new(self.recipient?),
                recipient_currency: self.recipient_currency.unwrap_or(self.currency),
                amount: self.amount?,
                reference: self.reference,
            }),
            _ => None,
        }
    }
}

/// Replays operations from a CSV reader, in file order.
///
/// Malformed rows and failed operations are logged and skipped.
///
/// # CSV Format
///
/// ```csv
/// type,user,currency,recipient,recipient_currency,amount,reference
/// open,kofi,GHS,,,,
/// fund,ada,NGN,,,5000,ps_ref_1
/// transfer,ada,NGN,kofi,GHS,1000,send-1
/// ```
///
/// # Errors
///
/// Returns a CSV error if the reader fails or the CSV structure is invalid.
pub async fn process_operations<R: Read>(
    engine: &TransferEngine,
    reader: R,
) -> Result<(), csv::Error> {
    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    for result in rdr.deserialize::<CsvRecord>() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "skipping malformed row");
                continue;
            }
        };
        let Some(operation) = record.into_operation() else {
            warn!("skipping invalid operation record");
            continue;
        };
        apply(engine, operation).await;
    }

    info!(wallets = engine.wallets().len(), entries = engine.journal().len(), "replay finished");
    Ok(())
}

async fn apply(engine: &TransferEngine, operation: Operation) {
    match operation {
        Operation::Open { user, currency } => {
            engine.open_wallet(&user, currency);
        }
        Operation::Fund(credit) => {
            let reference = credit.reference.clone();
            if let Err(e) = engine.credit_funding(credit) {
                warn!(%reference, error = %e, "skipping funding");
            }
        }
        Operation::Transfer {
            user,
            currency,
            recipient,
            recipient_currency,
            amount,
            reference,
        } => {
            let Some(source) = engine.wallets().get_wallet(&user, currency) else {
                warn!(%user, %currency, "skipping transfer from unknown wallet");
                return;
            };
            let Some(destination) = engine.wallets().get_wallet(&recipient, recipient_currency)
            else {
                warn!(
                    %recipient,
                    currency = %recipient_currency,
                    "skipping transfer to unknown wallet"
                );
                return;
            };
            let mut request = TransferRequest::new(source.id(), destination.id(), amount);
            if let Some(reference) = reference {
                request = request.with_idempotency_key(reference);
            }
            if let Err(e) = engine.transfer(&user, request).await {
                warn!(%user, error = %e, "skipping transfer");
            }
        }
    }
}

/// Writes wallet balances as `user,currency,balance`, rounded to 4 decimal
/// places.
pub fn write_wallets<W: Write>(engine: &TransferEngine, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);
    for wallet in engine.wallets().all() {
        wtr.serialize(wallet.as_ref())?;
    }
    wtr.flush()?;
    Ok(())
}

/// Writes every journal record, in insertion order.
pub fn write_journal<W: Write>(engine: &TransferEngine, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);
    for record in engine.journal().records() {
        wtr.serialize(&record)?;
    }
    wtr.flush()?;
    Ok(())
}
