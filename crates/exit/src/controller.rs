//! Per-position exit state machine.
//!
//! Consumes price ticks, decides stop-loss / take-profit / tier exits,
//! places a single broker request per decision and reconciles on the
//! broker's fill webhooks. At most one pending exit exists per trade; all
//! per-trade work runs under that trade's lock, and the lock is never held
//! across a broker HTTP call.

use crate::locks::PositionLocks;
use crate::triggers::{self, ExitPlan};
use chrono::Utc;
use helmsman_core::{
    Broker, ExitConfig, ExitKind, Notifier, OperationKind, PendingExit, PendingExitState,
    Position, PositionStatus, PositionStore, PositionWithTiers, PriceQuote, Side, TierRecord,
    TradeOperation, WebhookMessage, WEBHOOK_ENTRY_FILL, WEBHOOK_EXIT_FILL,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Quantities this close to zero count as a fully closed position.
const AMOUNT_EPSILON: f64 = 1e-6;
/// Relative distance at which a level counts as "near" for telemetry.
const NEAR_TRIGGER_EPSILON: f64 = 1e-6;
/// Webhook duplicates are tracked over this many recent fills.
const FILL_DEDUPE_CAPACITY: usize = 256;

struct TrackedExit {
    exit: PendingExit,
    age_warned: bool,
}

pub struct ExitController {
    store: Arc<dyn PositionStore>,
    broker: Arc<dyn Broker>,
    notifier: Arc<dyn Notifier>,
    cfg: ExitConfig,
    pending: Mutex<HashMap<i64, TrackedExit>>,
    missing_price: Mutex<HashSet<String>>,
    locks: PositionLocks,
    cache: RwLock<HashMap<i64, PositionWithTiers>>,
    recent_fills: Mutex<(VecDeque<String>, HashSet<String>)>,
}

impl ExitController {
    #[must_use]
    pub fn new(
        store: Arc<dyn PositionStore>,
        broker: Arc<dyn Broker>,
        notifier: Arc<dyn Notifier>,
        cfg: ExitConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            broker,
            notifier,
            cfg,
            pending: Mutex::new(HashMap::new()),
            missing_price: Mutex::new(HashSet::new()),
            locks: PositionLocks::new(),
            cache: RwLock::new(HashMap::new()),
            recent_fills: Mutex::new((VecDeque::new(), HashSet::new())),
        })
    }

    /// Reloads the active-position cache from the store.
    ///
    /// # Errors
    /// Propagates store failures.
    pub async fn refresh_cache(&self) -> anyhow::Result<()> {
        let positions = self.store.list_active_positions().await?;
        let mut cache = self.cache.write();
        cache.clear();
        for p in positions {
            cache.insert(p.position.trade_id, p);
        }
        Ok(())
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    #[must_use]
    pub fn missing_price_count(&self) -> usize {
        self.missing_price.lock().len()
    }

    fn positions_for(&self, symbol: &str) -> Vec<PositionWithTiers> {
        self.cache
            .read()
            .values()
            .filter(|p| p.position.symbol.eq_ignore_ascii_case(symbol))
            .cloned()
            .collect()
    }

    /// Evaluates every eligible position on the symbol against a fresh
    /// quote. Called by the price-tick consumer loop and the periodic sweep.
    pub async fn on_price_tick(&self, symbol: &str, quote: &PriceQuote) {
        let symbol = symbol.trim().to_uppercase();
        if symbol.is_empty() {
            return;
        }
        let mut positions = self.positions_for(&symbol);
        if positions.is_empty() {
            if !self.cache.read().is_empty() {
                return;
            }
            if self.refresh_cache().await.is_err() {
                return;
            }
            positions = self.positions_for(&symbol);
            if positions.is_empty() {
                return;
            }
        }

        if quote.is_empty() || quote.last <= 0.0 {
            self.report_missing_price(&symbol).await;
            return;
        }
        self.clear_missing_price(&symbol);

        for snapshot in positions {
            let trade_id = snapshot.position.trade_id;
            if !snapshot.position.status.is_active() {
                continue;
            }
            if self.warn_or_skip_pending(trade_id).await {
                continue;
            }
            if snapshot.tiers.is_placeholder || !snapshot.tiers.has_complete_tier() {
                continue;
            }
            self.log_near_triggers(&snapshot, quote);

            let lock = self.locks.lock_for(trade_id);
            let guard = lock.lock().await;
            // State may have moved while we waited for the lock.
            if self.pending.lock().contains_key(&trade_id) {
                continue;
            }
            let live = match self.store.get_live_position(trade_id).await {
                Ok(Some(live)) => live,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(trade_id, error = %e, "store read failed during tick");
                    continue;
                }
            };
            if !live.position.status.is_active() {
                continue;
            }
            let Some(plan) =
                triggers::evaluate(live.position.side, quote, &live.tiers, self.cfg.tick_confirm)
            else {
                continue;
            };
            let Some(pending) = self.begin_pending_close(&live, &plan).await else {
                continue;
            };
            drop(guard);
            self.dispatch_exit(pending).await;
        }
    }

    /// True when the trade already has a pending exit (optionally warning
    /// about its age once).
    async fn warn_or_skip_pending(&self, trade_id: i64) -> bool {
        let warn_after = chrono::Duration::seconds(self.cfg.pending_exit_warn_secs as i64);
        let stale = {
            let mut pending = self.pending.lock();
            let Some(tracked) = pending.get_mut(&trade_id) else {
                return false;
            };
            if !tracked.age_warned && Utc::now() - tracked.exit.requested_at > warn_after {
                tracked.age_warned = true;
                Some(tracked.exit.clone())
            } else {
                None
            }
        };
        if let Some(exit) = stale {
            tracing::warn!(
                trade_id,
                kind = exit.kind.as_str(),
                requested_at = %exit.requested_at,
                "pending exit has not been confirmed for a long time"
            );
            self.notify(&format!(
                "Pending exit unconfirmed for trade {trade_id} ({}) since {}; check the broker",
                exit.kind.as_str(),
                exit.requested_at.to_rfc3339()
            ))
            .await;
        }
        true
    }

    fn log_near_triggers(&self, snapshot: &PositionWithTiers, quote: &PriceQuote) {
        let t = &snapshot.tiers;
        let levels = [
            ("stop_loss", t.stop_loss),
            ("take_profit", t.take_profit),
            ("tier1", t.tier1_price),
            ("tier2", t.tier2_price),
            ("tier3", t.tier3_price),
        ];
        for (name, level) in levels {
            if level <= 0.0 {
                continue;
            }
            if ((quote.last - level) / level).abs() <= NEAR_TRIGGER_EPSILON {
                tracing::info!(
                    trade_id = snapshot.position.trade_id,
                    symbol = %snapshot.position.symbol,
                    target = name,
                    level,
                    last = quote.last,
                    "price touching exit level"
                );
            }
        }
    }

    /// Records the pending exit and flips the position into its closing
    /// state. Runs under the position lock; the broker call happens later,
    /// outside the lock.
    async fn begin_pending_close(
        &self,
        live: &PositionWithTiers,
        plan: &ExitPlan,
    ) -> Option<PendingExit> {
        let p = &live.position;
        let trade_id = p.trade_id;
        if p.symbol.is_empty() || trade_id == 0 {
            return None;
        }
        let current = p.current_amount;
        if current <= 0.0 {
            return None;
        }
        let initial = p.initial_amount.max(current);
        let effective_ratio = plan.ratio.clamp(0.0, 1.0);
        let close_qty = if plan.force_full {
            current
        } else {
            helmsman_core::amount::close_amount(current, initial, effective_ratio, true)
        };
        if close_qty <= 0.0 {
            tracing::warn!(trade_id, ratio = plan.ratio, "rejecting zero-quantity exit");
            return None;
        }
        let force_full = plan.force_full || close_qty >= current - AMOUNT_EPSILON;

        let exit = PendingExit {
            trade_id,
            symbol: p.symbol.clone(),
            side: p.side,
            kind: plan.kind,
            covered_tiers: plan.covered.clone(),
            target_price: plan.trigger_price,
            effective_ratio,
            prev_amount: current,
            prev_closed: p.closed_amount,
            initial_amount: initial,
            target_amount: close_qty,
            expected_amount: (current - close_qty).max(0.0),
            requested_at: Utc::now(),
            state: PendingExitState::Queued,
            force_full,
            operation_tag: OperationKind::for_exit(plan.kind),
        };
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&trade_id) {
                return None;
            }
            pending.insert(
                trade_id,
                TrackedExit {
                    exit: exit.clone(),
                    age_warned: false,
                },
            );
        }

        let next_status = if force_full {
            PositionStatus::ClosingFull
        } else {
            PositionStatus::ClosingPartial
        };
        if !p.status.can_transition_to(next_status) {
            tracing::warn!(
                trade_id,
                from = p.status.as_str(),
                to = next_status.as_str(),
                "illegal status transition, dropping exit"
            );
            self.pending.lock().remove(&trade_id);
            return None;
        }
        if let Err(e) = self.store.update_order_status(trade_id, next_status).await {
            tracing::error!(trade_id, error = %e, "failed to persist closing status");
            self.pending.lock().remove(&trade_id);
            return None;
        }
        if let Some(cached) = self.cache.write().get_mut(&trade_id) {
            cached.position.status = next_status;
        }

        let detail = serde_json::json!({
            "event_type": format!("CLOSING_{}", plan.kind.as_str().to_uppercase()),
            "price": plan.trigger_price,
            "close_ratio": effective_ratio,
            "close_quantity": close_qty,
            "expected_amount": exit.expected_amount,
            "remaining_ratio": live.tiers.remaining_ratio,
            "covered_tiers": plan.covered.iter().map(|t| t.as_str()).collect::<Vec<_>>(),
            "side": p.side.as_str(),
            "stake": p.stake,
            "leverage": p.leverage,
            "entry_price": p.entry_price,
            "take_profit": live.tiers.take_profit,
            "stop_loss": live.tiers.stop_loss,
        });
        self.append_operation(trade_id, &p.symbol, exit.operation_tag, detail)
            .await;
        Some(exit)
    }

    /// Fires the broker request for a queued exit. On failure the pending
    /// exit is kept so reconciliation (or an operator) can resolve it.
    async fn dispatch_exit(&self, exit: PendingExit) {
        let trade_id = exit.trade_id;
        self.set_pending_state(trade_id, PendingExitState::InFlight);
        match self
            .broker
            .force_exit(trade_id, Some(exit.target_amount))
            .await
        {
            Ok(()) => {
                self.set_pending_state(trade_id, PendingExitState::Acked);
                self.notify(&exit_notification(&exit)).await;
            }
            Err(e) => {
                tracing::error!(trade_id, error = %e, "broker force-exit failed");
                self.set_pending_state(trade_id, PendingExitState::Queued);
                self.append_operation(
                    trade_id,
                    &exit.symbol,
                    OperationKind::Failed,
                    serde_json::json!({
                        "event_type": exit.kind.as_str().to_uppercase(),
                        "error": e.to_string(),
                        "amount": exit.target_amount,
                    }),
                )
                .await;
                self.notify(&format!(
                    "Exit order failed for trade {trade_id} ({}) on {}: {e}",
                    exit.kind.as_str(),
                    exit.symbol
                ))
                .await;
            }
        }
    }

    fn set_pending_state(&self, trade_id: i64, state: PendingExitState) {
        if let Some(tracked) = self.pending.lock().get_mut(&trade_id) {
            tracked.exit.state = state;
        }
    }

    /// Webhook entry point for both fill kinds.
    pub async fn on_webhook(&self, msg: &WebhookMessage) {
        match msg.kind.as_str() {
            WEBHOOK_ENTRY_FILL => self.handle_entry_fill(msg).await,
            WEBHOOK_EXIT_FILL => self.handle_exit_fill(msg).await,
            other => tracing::debug!(kind = other, "ignoring webhook"),
        }
    }

    async fn handle_entry_fill(&self, msg: &WebhookMessage) {
        if msg.trade_id == 0 || msg.amount <= 0.0 {
            tracing::warn!("entry fill with missing trade id or amount");
            return;
        }
        let symbol = msg.symbol();
        let side = Side::parse(&msg.direction).unwrap_or(Side::Long);
        let position = Position {
            trade_id: msg.trade_id,
            symbol: symbol.clone(),
            side,
            entry_price: msg.open_rate,
            initial_amount: msg.amount,
            current_amount: msg.amount,
            closed_amount: 0.0,
            stake: msg.stake_amount,
            leverage: msg.leverage,
            status: PositionStatus::Open,
            opened_at: Utc::now(),
        };
        // The decision layer will replace this placeholder with real levels.
        let tiers = TierRecord {
            is_placeholder: true,
            remaining_ratio: 1.0,
            ..TierRecord::default()
        };
        if let Err(e) = self.store.save_position(&position, &tiers).await {
            tracing::error!(trade_id = msg.trade_id, error = %e, "failed to persist entry fill");
            return;
        }
        self.append_operation(
            msg.trade_id,
            &symbol,
            OperationKind::Entry,
            serde_json::json!({
                "amount": msg.amount,
                "open_rate": msg.open_rate,
                "stake": msg.stake_amount,
                "leverage": msg.leverage,
                "side": side.as_str(),
            }),
        )
        .await;
        self.cache
            .write()
            .insert(msg.trade_id, PositionWithTiers { position, tiers });
        tracing::info!(trade_id = msg.trade_id, %symbol, "entry fill recorded");
    }

    async fn handle_exit_fill(&self, msg: &WebhookMessage) {
        let trade_id = msg.trade_id;
        if trade_id == 0 {
            tracing::warn!("exit fill without trade id");
            return;
        }
        if self.is_duplicate_fill(msg) {
            tracing::info!(trade_id, "duplicate exit fill ignored");
            return;
        }

        let lock = self.locks.lock_for(trade_id);
        let _guard = lock.lock().await;

        let pending = self
            .pending
            .lock()
            .get(&trade_id)
            .map(|t| t.exit.clone());
        let live = match self.store.get_live_position(trade_id).await {
            Ok(Some(live)) => live,
            Ok(None) => {
                // Stale or manually closed position; nothing to reconcile.
                tracing::warn!(trade_id, "exit fill for unknown trade");
                self.pending.lock().remove(&trade_id);
                return;
            }
            Err(e) => {
                tracing::error!(trade_id, error = %e, "store read failed during exit fill");
                return;
            }
        };

        let mut position = live.position;
        let mut tiers = live.tiers;
        let amount = if msg.amount > 0.0 {
            msg.amount
        } else {
            pending.as_ref().map_or(0.0, |p| p.target_amount)
        };
        if amount <= 0.0 {
            tracing::warn!(trade_id, "exit fill without amount");
            return;
        }

        position.closed_amount += amount;
        position.current_amount = (position.current_amount - amount).max(0.0);
        let initial = position
            .initial_amount
            .max(position.current_amount + position.closed_amount);
        position.initial_amount = initial;

        if position.current_amount <= AMOUNT_EPSILON {
            position.current_amount = 0.0;
            if position.status != PositionStatus::Closed
                && !position.status.can_transition_to(PositionStatus::Closed)
            {
                tracing::warn!(
                    trade_id,
                    from = position.status.as_str(),
                    "closing fill arrived outside a closing state"
                );
            }
            position.status = PositionStatus::Closed;
            tiers.mark_all_done();
            tiers.remaining_ratio = 0.0;
        } else {
            if let Some(p) = &pending {
                if matches!(p.kind, ExitKind::Tier(_)) {
                    for name in &p.covered_tiers {
                        tiers.mark_done(*name);
                    }
                }
            }
            tiers.remaining_ratio = if initial > 0.0 {
                position.current_amount / initial
            } else {
                0.0
            };
            if position.status.can_transition_to(PositionStatus::Partial) {
                position.status = PositionStatus::Partial;
            } else if position.status != PositionStatus::Closed {
                tracing::warn!(
                    trade_id,
                    from = position.status.as_str(),
                    "partial fill in unexpected state, keeping status"
                );
            }
        }

        if let Err(e) = self.store.save_position(&position, &tiers).await {
            tracing::error!(trade_id, error = %e, "failed to persist exit fill");
            return;
        }
        if let Some(tag) = pending.as_ref().map(|p| p.operation_tag) {
            self.append_operation(
                trade_id,
                &position.symbol,
                tag,
                serde_json::json!({
                    "event_type": "EXIT_FILL",
                    "amount": amount,
                    "close_rate": msg.close_rate,
                    "remaining": position.current_amount,
                    "status": position.status.as_str(),
                }),
            )
            .await;
        }
        self.pending.lock().remove(&trade_id);
        self.remember_fill(msg);
        if position.status == PositionStatus::Closed {
            self.cache.write().remove(&trade_id);
        } else {
            self.cache.write().insert(
                trade_id,
                PositionWithTiers {
                    position: position.clone(),
                    tiers,
                },
            );
        }
        self.notify(&format!(
            "Exit fill for trade {trade_id} on {}: {:.6} @ {:.4}, remaining {:.6} ({})",
            position.symbol,
            amount,
            msg.close_rate,
            position.current_amount,
            position.status.as_str()
        ))
        .await;
    }

    fn fill_key(msg: &WebhookMessage) -> String {
        format!("{}:{:.8}:{:.8}", msg.trade_id, msg.amount, msg.close_rate)
    }

    fn is_duplicate_fill(&self, msg: &WebhookMessage) -> bool {
        self.recent_fills.lock().1.contains(&Self::fill_key(msg))
    }

    /// Marks a fill as processed so broker retries of the same
    /// (trade, amount, rate) triple apply idempotently.
    fn remember_fill(&self, msg: &WebhookMessage) {
        let key = Self::fill_key(msg);
        let mut fills = self.recent_fills.lock();
        if fills.1.insert(key.clone()) {
            fills.0.push_back(key);
        }
        if fills.0.len() > FILL_DEDUPE_CAPACITY {
            if let Some(old) = fills.0.pop_front() {
                fills.1.remove(&old);
            }
        }
    }

    async fn report_missing_price(&self, symbol: &str) {
        {
            let mut missing = self.missing_price.lock();
            if !missing.insert(symbol.to_string()) {
                return;
            }
        }
        tracing::warn!(%symbol, "no fresh price, exit evaluation suspended");
        self.notify(&format!(
            "Exit monitoring paused for {symbol}: no fresh trade price"
        ))
        .await;
    }

    fn clear_missing_price(&self, symbol: &str) {
        self.missing_price.lock().remove(symbol);
    }

    async fn append_operation(
        &self,
        trade_id: i64,
        symbol: &str,
        kind: OperationKind,
        detail: serde_json::Value,
    ) {
        let op = TradeOperation {
            trade_id,
            symbol: symbol.to_string(),
            kind,
            detail,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.append_trade_operation(&op).await {
            tracing::warn!(trade_id, error = %e, "failed to append operation log");
        }
    }

    async fn notify(&self, text: &str) {
        if let Err(e) = self.notifier.send_text(text).await {
            tracing::warn!(error = %e, "notifier send failed");
        }
    }
}

fn exit_notification(exit: &PendingExit) -> String {
    match exit.kind {
        ExitKind::StopLoss => format!(
            "Stop loss hit for trade {} on {}: closing {:.6} @ {:.4}",
            exit.trade_id, exit.symbol, exit.target_amount, exit.target_price
        ),
        ExitKind::TakeProfit => format!(
            "Take profit hit for trade {} on {}: closing {:.6} @ {:.4}",
            exit.trade_id, exit.symbol, exit.target_amount, exit.target_price
        ),
        ExitKind::Tier(name) => format!(
            "{} hit for trade {} on {} (covering {}): closing {:.6} @ {:.4}",
            name.as_str(),
            exit.trade_id,
            exit.symbol,
            exit.covered_tiers
                .iter()
                .map(|t| t.as_str())
                .collect::<Vec<_>>()
                .join("+"),
            exit.target_amount,
            exit.target_price
        ),
    }
}
