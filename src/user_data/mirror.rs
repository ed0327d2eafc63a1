use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::RwLock;

use super::events::{is_isolated_margin, BalanceUpdate, PositionUpdate};
use crate::{
    errors::{ErrorNotice, PendingErrors},
    queue::OverwriteQueue,
    types::AccountSnapshot,
};

/// In-process copy of the account.
///
/// Full snapshots replace everything; stream updates only overwrite the fields they
/// carry so REST-only values survive until the next snapshot. The lock is never held
/// across I/O.
pub struct AccountMirror {
    account: RwLock<Option<AccountSnapshot>>,
    notices: Arc<OverwriteQueue<ErrorNotice>>,
}

impl AccountMirror {
    pub fn new(notices: Arc<OverwriteQueue<ErrorNotice>>) -> Self {
        Self {
            account: RwLock::new(None),
            notices,
        }
    }

    pub async fn replace_snapshot(&self, snapshot: AccountSnapshot) {
        *self.account.write().await = Some(snapshot);
    }

    /// Returns `false` when the asset is not in the current snapshot. Unknown assets are
    /// never inserted.
    pub async fn merge_balance(
        &self,
        asset: &str,
        wallet_balance: Decimal,
        cross_wallet_balance: Decimal,
    ) -> bool {
        let mut guard = self.account.write().await;
        let Some(record) = guard.as_mut().and_then(|account| account.balance_mut(asset)) else {
            return false;
        };
        record.wallet_balance = wallet_balance;
        record.cross_wallet_balance = cross_wallet_balance;
        true
    }

    /// Returns `false` when the symbol is not in the current snapshot. `margin_type` is
    /// the stream's margin mode string and decides the isolated flag.
    pub async fn merge_position(
        &self,
        symbol: &str,
        amount: Decimal,
        entry_price: Decimal,
        unrealized_pnl: Decimal,
        margin_type: &str,
        position_side: &str,
    ) -> bool {
        let mut guard = self.account.write().await;
        let Some(record) = guard
            .as_mut()
            .and_then(|account| account.position_mut(symbol))
        else {
            return false;
        };
        record.position_amount = amount;
        record.entry_price = entry_price;
        record.unrealized_profit = unrealized_pnl;
        record.isolated = is_isolated_margin(margin_type);
        record.position_side = position_side.to_owned();
        true
    }

    pub async fn apply_balance(&self, update: &BalanceUpdate) -> bool {
        self.merge_balance(
            &update.asset,
            update.wallet_balance,
            update.cross_wallet_balance,
        )
        .await
    }

    pub async fn apply_position(&self, update: &PositionUpdate) -> bool {
        self.merge_position(
            &update.symbol,
            update.amount,
            update.entry_price,
            update.unrealized_pnl,
            &update.margin_type,
            &update.position_side,
        )
        .await
    }

    pub fn record_notice(&self, notice: ErrorNotice) {
        self.notices.push(notice);
    }

    /// Copy of the current account plus every pending notice, drained.
    pub async fn read(&self) -> (Option<AccountSnapshot>, Option<PendingErrors>) {
        let snapshot = self.account.read().await.clone();
        let pending = PendingErrors::from_notices(self.notices.drain());
        (snapshot, pending)
    }

}
