// Local user data mirror
// Streams trade fills and prints the mirrored account every 30 seconds.
//
// Requires APX_API_KEY / APX_API_SECRET (a .env file works). Set APX_CONFIG to load a
// TOML file instead of the defaults.

use std::time::Duration;

use apx_client::{ApiCredentials, ApxClient, UserDataConfig};
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let credentials = ApiCredentials::from_env().ok_or("APX_API_KEY and APX_API_SECRET must be set")?;
    let config = match std::env::var("APX_CONFIG") {
        Ok(path) => UserDataConfig::from_file(path).map_err(|e| -> BoxError { e.into() })?,
        Err(_) => UserDataConfig::default(),
    };

    let client = ApxClient::with_config(credentials, config)?;
    println!("📡 Starting local user data...");
    let local = client.local_user_data().await?;

    print_account(&local).await;

    let mut report = tokio::time::interval(Duration::from_secs(30));
    report.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = report.tick() => print_account(&local).await,
            trade = local.next_trade() => match trade {
                Ok(fill) => println!(
                    "💱 {} {} {} @ {} (fee {} {}, maker: {})",
                    fill.symbol,
                    fill.side,
                    fill.quantity,
                    fill.price,
                    fill.fee,
                    fill.fee_asset.as_deref().unwrap_or("-"),
                    fill.is_maker,
                ),
                Err(_) => break,
            },
        }
    }

    println!("🛑 Shutting down...");
    local.shutdown().await;
    Ok(())
}

async fn print_account(local: &apx_client::LocalUserData) {
    let (account, errors) = local.read().await;
    if let Some(errors) = errors {
        println!("⚠️  {errors}");
    }
    let Some(account) = account else {
        println!("⏳ No account snapshot yet");
        return;
    };
    println!("💰 Wallet balance: {}", account.total_wallet_balance);
    for asset in account.assets.iter().filter(|a| !a.wallet_balance.is_zero()) {
        println!(
            "   {:<6} wallet {} cross {}",
            asset.asset, asset.wallet_balance, asset.cross_wallet_balance
        );
    }
    for position in account.positions.iter().filter(|p| !p.position_amount.is_zero()) {
        println!(
            "   {:<10} {} @ {} (uPnL {}, {})",
            position.symbol,
            position.position_amount,
            position.entry_price,
            position.unrealized_profit,
            if position.isolated { "isolated" } else { "cross" },
        );
    }
}
