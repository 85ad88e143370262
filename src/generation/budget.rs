use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::BudgetExceeded;

/// Rough token estimate for text sent to a provider (four characters per token).
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count() as u32;
    chars.div_ceil(4)
}

/// Token accounting for one run.
///
/// Every provider call reserves its worst case up front and settles the actual
/// usage afterwards, so `consumed + reserved <= total` holds at all times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBudget {
    total: u32,
    consumed: u32,
    reserved: u32,
}

/// Tokens held for one in-flight call.
///
/// Must be handed back through [`TokenBudget::settle`] or
/// [`TokenBudget::release`].
#[derive(Debug, PartialEq, Eq)]
#[must_use]
pub struct Reservation {
    tokens: u32,
}

impl Reservation {
    /// Reserved token count
    pub fn tokens(&self) -> u32 {
        self.tokens
    }
}

/// Snapshot of a budget, reported in run results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub consumed: u32,
    pub remaining: u32,
}

impl TokenBudget {
    /// Create a budget with `total` tokens available
    pub fn new(total: u32) -> Self {
        Self {
            total,
            consumed: 0,
            reserved: 0,
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn consumed(&self) -> u32 {
        self.consumed
    }

    /// Tokens neither consumed nor held by an open reservation.
    pub fn remaining(&self) -> u32 {
        self.total - self.consumed - self.reserved
    }

    /// Whether `required` tokens are currently available.
    pub fn covers(&self, required: u32) -> bool {
        self.remaining() >= required
    }

    /// Hold `tokens` for a call about to start.
    pub fn reserve(&mut self, tokens: u32) -> Result<Reservation, BudgetExceeded> {
        let remaining = self.remaining();
        if remaining < tokens {
            return Err(BudgetExceeded {
                requested: tokens,
                remaining,
            });
        }
        self.reserved += tokens;
        Ok(Reservation { tokens })
    }

    /// Charge the actual usage of a finished call and refund the rest.
    ///
    /// Usage above the reservation is capped at the reservation. Returns the
    /// number of tokens charged.
    pub fn settle(&mut self, reservation: Reservation, actual: u32) -> u32 {
        let charged = actual.min(reservation.tokens);
        if actual > reservation.tokens {
            warn!(
                reserved = reservation.tokens,
                reported = actual,
                "Provider reported usage above reservation"
            );
        }
        self.reserved -= reservation.tokens;
        self.consumed += charged;
        charged
    }

    /// Return an unused reservation.
    pub fn release(&mut self, reservation: Reservation) {
        self.reserved -= reservation.tokens;
    }

    pub fn usage(&self) -> TokenUsage {
        TokenUsage {
            consumed: self.consumed,
            remaining: self.total - self.consumed,
        }
    }
}
