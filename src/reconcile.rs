// =============================================================================
// Reconciliation Engine — poll exchange order status, update Position state
// =============================================================================
//
// SAFETY POLICY: this module never cancels orders or closes positions on the
// exchange itself. It only observes: it polls each open position's entry/TP/
// SL order status via the venue client and updates the local `Position`
// record to match. A human operator or the Order Service's own retry logic
// is responsible for any corrective action against the exchange.
//
// This is the one mechanism — besides the Order Service's own writes — that
// ever transitions a `Position` out of `open` (spec §3): closed when the TP
// or SL order is reported filled, cancelled when the entry order itself
// never filled.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::position_engine::{Position, PositionManager};
use crate::types::Venue;
use crate::venue::{ExchangeClient, OrderStatus};

/// Summary of a single reconciliation pass across every tracked venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileResult {
    /// Open positions whose entry order is filled and still awaiting TP/SL.
    pub positions_checked: u32,
    /// Positions closed this pass because their TP or SL order filled.
    pub closed: u32,
    /// Positions cancelled this pass because their entry order never filled.
    pub cancelled: u32,
    /// Positions skipped because a venue call failed or no client exists for
    /// that venue — left untouched until the next pass.
    pub poll_errors: u32,
    pub timestamp: String,
}

enum Outcome {
    StillOpen,
    Closed,
    Cancelled,
}

/// Run one reconciliation cycle over every open position, regardless of
/// which bot owns it. `clients` must contain an entry for every venue with
/// open positions; a position whose venue has no client counts as a poll
/// error and is left alone.
pub async fn reconcile_once(
    clients: &HashMap<Venue, Arc<dyn ExchangeClient>>,
    positions: &PositionManager,
) -> ReconcileResult {
    let now = Utc::now().to_rfc3339();
    let open = positions.get_open_positions();
    debug!(open_count = open.len(), "reconciliation cycle started");

    let mut checked = 0u32;
    let mut closed = 0u32;
    let mut cancelled = 0u32;
    let mut poll_errors = 0u32;

    for position in &open {
        let Some(client) = clients.get(&position.venue) else {
            warn!(position_id = %position.id, venue = %position.venue, "no exchange client for venue, skipping");
            poll_errors += 1;
            continue;
        };

        match reconcile_position(client.as_ref(), positions, position).await {
            Ok(Outcome::StillOpen) => checked += 1,
            Ok(Outcome::Closed) => closed += 1,
            Ok(Outcome::Cancelled) => cancelled += 1,
            Err(e) => {
                warn!(position_id = %position.id, error = %e, "failed to poll order status during reconciliation");
                poll_errors += 1;
            }
        }
    }

    let result = ReconcileResult { positions_checked: checked, closed, cancelled, poll_errors, timestamp: now };
    info!(
        positions_checked = checked,
        closed,
        cancelled,
        poll_errors,
        "reconciliation cycle completed"
    );
    result
}

async fn reconcile_position(
    client: &dyn ExchangeClient,
    positions: &PositionManager,
    position: &Position,
) -> anyhow::Result<Outcome> {
    let Some(entry_order_id) = &position.entry_order_id else {
        // Entry ack hasn't been recorded yet (race between placement and
        // `record_order_ids`); nothing to reconcile this pass.
        return Ok(Outcome::StillOpen);
    };

    let entry_status = client
        .get_order_status(&position.symbol, entry_order_id)
        .await
        .map_err(|e| anyhow::anyhow!("entry status poll failed: {e}"))?;

    if matches!(entry_status, OrderStatus::Rejected | OrderStatus::Canceled | OrderStatus::Expired) {
        positions.cancel_position(&position.id, format!("entry order {entry_status:?}"));
        return Ok(Outcome::Cancelled);
    }
    if matches!(entry_status, OrderStatus::New) {
        // Entry still resting (counter-trend LIMIT awaiting fill).
        return Ok(Outcome::StillOpen);
    }

    if let Some(tp_order_id) = &position.tp_order_id {
        let tp_status = client
            .get_order_status(&position.symbol, tp_order_id)
            .await
            .map_err(|e| anyhow::anyhow!("tp status poll failed: {e}"))?;
        if tp_status == OrderStatus::Filled {
            let pnl = position.unrealized_pnl(position.take_profit_price);
            positions.close_position(&position.id, "take_profit", pnl);
            return Ok(Outcome::Closed);
        }
    }

    if let Some(sl_order_id) = &position.sl_order_id {
        let sl_status = client
            .get_order_status(&position.symbol, sl_order_id)
            .await
            .map_err(|e| anyhow::anyhow!("sl status poll failed: {e}"))?;
        if sl_status == OrderStatus::Filled {
            let pnl = match position.stop_loss_price {
                Some(sl_price) => position.unrealized_pnl(sl_price),
                None => 0.0,
            };
            positions.close_position(&position.id, "stop_loss", pnl);
            return Ok(Outcome::Closed);
        }
    }

    Ok(Outcome::StillOpen)
}

/// Spawn the periodic reconciliation loop.
pub async fn run_reconcile_loop(
    clients: HashMap<Venue, Arc<dyn ExchangeClient>>,
    positions: Arc<PositionManager>,
    period: Duration,
) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let _result = reconcile_once(&clients, &positions).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use crate::venue::{NewOrder, OrderAck, VenueError};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct ScriptedClient {
        statuses: Mutex<HashMap<String, OrderStatus>>,
    }

    impl ScriptedClient {
        fn new(statuses: Vec<(&str, OrderStatus)>) -> Self {
            Self { statuses: Mutex::new(statuses.into_iter().map(|(k, v)| (k.to_string(), v)).collect()) }
        }
    }

    #[async_trait]
    impl ExchangeClient for ScriptedClient {
        async fn place_order(&self, _order: NewOrder<'_>) -> Result<OrderAck, VenueError> {
            unimplemented!("not exercised by reconciliation tests")
        }
        async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> Result<(), VenueError> {
            Ok(())
        }
        async fn get_order_status(&self, _symbol: &str, order_id: &str) -> Result<OrderStatus, VenueError> {
            Ok(self.statuses.lock().get(order_id).cloned().unwrap_or(OrderStatus::New))
        }
        async fn get_account(&self) -> Result<serde_json::Value, VenueError> {
            Ok(serde_json::json!({}))
        }
        async fn get_exchange_info(&self, _symbol: &str) -> Result<serde_json::Value, VenueError> {
            Ok(serde_json::json!({}))
        }
        async fn get_klines(&self, _symbol: &str, _interval: &str, _limit: u32) -> Result<Vec<crate::market_data::Candle>, VenueError> {
            Ok(vec![])
        }
    }

    fn open_position(entry: &str, tp: Option<&str>, sl: Option<&str>) -> (PositionManager, String) {
        let manager = PositionManager::new();
        let mut position = Position::new("b1", "s1", Venue::Binance, "BTCUSDT", Side::Long, 100.0, 1.0, 110.0, Some(90.0));
        let id = position.id.clone();
        position.entry_order_id = Some(entry.to_string());
        position.tp_order_id = tp.map(String::from);
        position.sl_order_id = sl.map(String::from);
        manager.seed(vec![position]);
        (manager, id)
    }

    fn clients(client: ScriptedClient) -> HashMap<Venue, Arc<dyn ExchangeClient>> {
        let mut map: HashMap<Venue, Arc<dyn ExchangeClient>> = HashMap::new();
        map.insert(Venue::Binance, Arc::new(client));
        map
    }

    #[tokio::test]
    async fn tp_filled_closes_position_with_take_profit_reason() {
        let (manager, id) = open_position("e1", Some("tp1"), Some("sl1"));
        let client = ScriptedClient::new(vec![
            ("e1", OrderStatus::Filled),
            ("tp1", OrderStatus::Filled),
            ("sl1", OrderStatus::New),
        ]);
        let result = reconcile_once(&clients(client), &manager).await;
        assert_eq!(result.closed, 1);
        let position = manager.find(&id).unwrap();
        assert_eq!(position.close_reason.as_deref(), Some("take_profit"));
    }

    #[tokio::test]
    async fn sl_filled_closes_position_with_stop_loss_reason() {
        let (manager, id) = open_position("e1", Some("tp1"), Some("sl1"));
        let client = ScriptedClient::new(vec![
            ("e1", OrderStatus::Filled),
            ("tp1", OrderStatus::New),
            ("sl1", OrderStatus::Filled),
        ]);
        let result = reconcile_once(&clients(client), &manager).await;
        assert_eq!(result.closed, 1);
        let position = manager.find(&id).unwrap();
        assert_eq!(position.close_reason.as_deref(), Some("stop_loss"));
    }

    #[tokio::test]
    async fn entry_rejected_cancels_position() {
        let (manager, id) = open_position("e1", None, None);
        let client = ScriptedClient::new(vec![("e1", OrderStatus::Rejected)]);
        let result = reconcile_once(&clients(client), &manager).await;
        assert_eq!(result.cancelled, 1);
        let position = manager.find(&id).unwrap();
        assert_eq!(position.status, crate::position_engine::PositionStatus::Cancelled);
    }

    #[tokio::test]
    async fn still_resting_entry_leaves_position_open() {
        let (manager, _id) = open_position("e1", None, None);
        let client = ScriptedClient::new(vec![("e1", OrderStatus::New)]);
        let result = reconcile_once(&clients(client), &manager).await;
        assert_eq!(result.positions_checked, 1);
        assert_eq!(manager.get_open_positions().len(), 1);
    }

    #[tokio::test]
    async fn missing_client_for_venue_counts_as_poll_error() {
        let (manager, _id) = open_position("e1", None, None);
        let result = reconcile_once(&HashMap::new(), &manager).await;
        assert_eq!(result.poll_errors, 1);
    }
}
