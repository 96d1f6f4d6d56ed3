use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    ledger::{Ledger, LedgerStore, UsageRecord},
    time::{Clock, DayBoundary},
};

pub const DEFAULT_DAILY_LIMIT: u32 = 10;

/// Every ledger access runs under one gate, reads included: the ledger is
/// persisted as a whole and a first load creates the file.
#[derive(Clone)]
pub struct QuotaLimiter {
    store: Arc<dyn LedgerStore>,
    daily_limit: u32,
    day_boundary: DayBoundary,
    clock: Arc<dyn Clock>,
    gate: Arc<Mutex<()>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub daily_limit: u32,
    pub today: NaiveDate,
    pub total_generations: u64,
    pub active_today: usize,
    pub usage: Ledger,
}

impl QuotaLimiter {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        daily_limit: u32,
        day_boundary: DayBoundary,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            daily_limit,
            day_boundary,
            clock,
            gate: Arc::new(Mutex::new(())),
        }
    }

    pub fn daily_limit(&self) -> u32 {
        self.daily_limit
    }

    pub fn today(&self) -> NaiveDate {
        self.day_boundary.date_of(self.clock.now())
    }

    /// Returns `false` without touching the ledger when the quota is used up.
    pub async fn check_and_increment(&self, username: &str) -> Result<bool> {
        let _gate = self.gate.lock().await;
        let today = self.today();
        let mut ledger = self.load().await?;
        let current = ledger.get(username).copied();
        let used = effective_count(current, today);

        if used >= self.daily_limit {
            info!(
                username,
                used,
                limit = self.daily_limit,
                "daily quota exhausted"
            );
            return Ok(false);
        }

        // A record dated after `today` means the clock stepped backwards; keep
        // the later date rather than rewinding it.
        let date = current.map_or(today, |record| record.date.max(today));
        ledger.insert(
            username.to_string(),
            UsageRecord {
                date,
                count: used + 1,
            },
        );
        self.save(ledger).await?;
        debug!(username, used = used + 1, limit = self.daily_limit, "quota consumed");

        Ok(true)
    }

    pub async fn remaining_requests(&self, username: &str) -> Result<u32> {
        let _gate = self.gate.lock().await;
        let today = self.today();
        let ledger = self.load().await?;
        let used = effective_count(ledger.get(username).copied(), today);

        Ok(self.daily_limit.saturating_sub(used))
    }

    pub async fn reset_all(&self) -> Result<()> {
        let _gate = self.gate.lock().await;
        self.save(Ledger::new()).await?;
        info!("usage ledger cleared");

        Ok(())
    }

    pub async fn reset_user(&self, username: &str) -> Result<bool> {
        let _gate = self.gate.lock().await;
        let mut ledger = self.load().await?;
        if ledger.remove(username).is_none() {
            return Ok(false);
        }

        self.save(ledger).await?;
        info!(username, "usage reset for user");

        Ok(true)
    }

    pub async fn usage_summary(&self) -> Result<UsageSummary> {
        let _gate = self.gate.lock().await;
        let today = self.today();
        let usage = self.load().await?;
        let total_generations = usage.values().map(|record| u64::from(record.count)).sum();
        let active_today = usage.values().filter(|record| record.date == today).count();

        Ok(UsageSummary {
            daily_limit: self.daily_limit,
            today,
            total_generations,
            active_today,
            usage,
        })
    }

    async fn load(&self) -> Result<Ledger> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.load())
            .await
            .context("usage ledger load task panicked")?
    }

    async fn save(&self, ledger: Ledger) -> Result<()> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.save(&ledger))
            .await
            .context("usage ledger save task panicked")?
    }
}

fn effective_count(record: Option<UsageRecord>, today: NaiveDate) -> u32 {
    match record {
        Some(record) if record.date >= today => record.count,
        _ => 0,
    }
}
