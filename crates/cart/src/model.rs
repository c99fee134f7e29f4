use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::{CartId, CorrelationId, LineItem, Money, UserId, order_total};
use serde::{Deserialize, Serialize};

use crate::{CartError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CartStatus {
    Active,
    CheckoutPending,
    CheckedOut,
}

impl CartStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CartStatus::Active => "active",
            CartStatus::CheckoutPending => "checkout_pending",
            CartStatus::CheckedOut => "checked_out",
        }
    }

    /// Transitions driven by saga outcomes. A failed or cancelled order
    /// hands the cart back to the shopper even after it was checked out.
    pub fn can_transition_to(&self, target: CartStatus) -> bool {
        use CartStatus::*;
        matches!(
            (self, target),
            (Active, CheckoutPending)
                | (CheckoutPending, CheckedOut)
                | (CheckoutPending, Active)
                | (CheckedOut, Active)
        )
    }
}

impl fmt::Display for CartStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CartStatus {
    type Err = CartError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(CartStatus::Active),
            "checkout_pending" => Ok(CartStatus::CheckoutPending),
            "checked_out" => Ok(CartStatus::CheckedOut),
            other => Err(CartError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cart {
    pub cart_id: CartId,
    pub user_id: UserId,
    pub items: Vec<LineItem>,
    pub status: CartStatus,
    /// The saga started by the latest checkout.
    pub checkout_correlation_id: Option<CorrelationId>,
    pub updated_at: DateTime<Utc>,
}

impl Cart {
    pub fn new(cart_id: CartId, user_id: UserId, items: Vec<LineItem>) -> Self {
        Self {
            cart_id,
            user_id,
            items,
            status: CartStatus::Active,
            checkout_correlation_id: None,
            updated_at: Utc::now(),
        }
    }

    pub fn total(&self) -> Money {
        order_total(&self.items)
    }

    /// Moves an active, non-empty cart to `checkout_pending`.
    pub fn begin_checkout(&mut self, correlation_id: CorrelationId) -> Result<()> {
        match self.status {
            CartStatus::CheckoutPending => return Err(CartError::CheckoutInProgress(self.cart_id)),
            CartStatus::CheckedOut => return Err(CartError::AlreadyCheckedOut(self.cart_id)),
            CartStatus::Active => {}
        }
        if self.items.is_empty() {
            return Err(CartError::Empty(self.cart_id));
        }

        self.status = CartStatus::CheckoutPending;
        self.checkout_correlation_id = Some(correlation_id);
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Applies a saga outcome for the cart's current checkout.
    ///
    /// Returns `false` (and changes nothing) when the correlation id does not
    /// match or the transition is not allowed.
    pub fn apply_outcome(&mut self, correlation_id: CorrelationId, target: CartStatus) -> bool {
        if self.checkout_correlation_id != Some(correlation_id)
            || !self.status.can_transition_to(target)
        {
            return false;
        }
        self.status = target;
        self.updated_at = Utc::now();
        true
    }
}
