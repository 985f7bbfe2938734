//! Per-mandate spend accounting.
//!
//! Two counters per mandate: a daily map keyed by UTC date and a lifetime
//! total. Counters live in process memory only and reset on restart.
//!
//! The budget gate is [`SpendTracker::try_charge`]: a check-and-add under
//! the tracker lock, so concurrent requests against the same mandate cannot
//! jointly exceed the cap the way a read-then-add would allow. The only
//! decrement is [`SpendTracker::refund`], invoked when settlement fails
//! after a charge was taken.

use chrono::{NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::usd::UsdAmount;

#[derive(Debug, Default)]
struct MandateSpend {
    daily: HashMap<NaiveDate, UsdAmount>,
    lifetime: UsdAmount,
}

/// Outcome of a charge attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeOutcome {
    Charged,
    /// The charge would push the day's total past the cap; nothing recorded.
    BudgetExceeded,
}

#[derive(Default)]
pub struct SpendTracker {
    inner: Mutex<HashMap<String, MandateSpend>>,
}

impl SpendTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Today's UTC date, the key for daily counters.
    pub fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    /// The recorded spend for a mandate on the given UTC date.
    pub fn spent_on(&self, mandate_id: &str, date: NaiveDate) -> UsdAmount {
        let inner = self.inner.lock().expect("spend tracker lock poisoned");
        inner
            .get(mandate_id)
            .and_then(|spend| spend.daily.get(&date).copied())
            .unwrap_or(UsdAmount::ZERO)
    }

    pub fn spent_today(&self, mandate_id: &str) -> UsdAmount {
        self.spent_on(mandate_id, Self::today())
    }

    /// Lifetime spend for a mandate.
    pub fn lifetime(&self, mandate_id: &str) -> UsdAmount {
        let inner = self.inner.lock().expect("spend tracker lock poisoned");
        inner
            .get(mandate_id)
            .map(|spend| spend.lifetime)
            .unwrap_or(UsdAmount::ZERO)
    }

    /// Atomically add `amount` to today's counter if the result stays within
    /// `cap`. Both the check and the add happen under the lock.
    pub fn try_charge(&self, mandate_id: &str, amount: UsdAmount, cap: UsdAmount) -> ChargeOutcome {
        let today = Self::today();
        let mut inner = self.inner.lock().expect("spend tracker lock poisoned");
        let spend = inner.entry(mandate_id.to_string()).or_default();
        let day = spend.daily.entry(today).or_default();
        if *day + amount > cap {
            return ChargeOutcome::BudgetExceeded;
        }
        *day = *day + amount;
        spend.lifetime = spend.lifetime + amount;
        ChargeOutcome::Charged
    }

    /// Roll back a charge after settlement failure. Clamped at zero.
    pub fn refund(&self, mandate_id: &str, amount: UsdAmount) {
        let today = Self::today();
        let mut inner = self.inner.lock().expect("spend tracker lock poisoned");
        if let Some(spend) = inner.get_mut(mandate_id) {
            if let Some(day) = spend.daily.get_mut(&today) {
                *day = day.saturating_sub(amount);
            }
            spend.lifetime = spend.lifetime.saturating_sub(amount);
        }
    }
}
