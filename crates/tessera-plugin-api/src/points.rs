//! Extension point vocabulary and typed invocation contexts.
//!
//! Slot names come in three namespaces: extension points (checkout and
//! public-page composition), widget areas (admin dashboard), and admin
//! component slots. Plugins declare which names they implement; the host
//! resolves each name against those declarations at render time.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Extension points the host renders on checkout and public event pages.
pub const KNOWN_EXTENSION_POINTS: &[&str] = &[
    "payment-methods",
    "checkout-summary",
    "order-confirmation",
    "ticket-detail-panel",
    "event-page-header",
    "event-page-footer",
];

/// Widget areas on the admin dashboard.
pub const KNOWN_WIDGET_AREAS: &[&str] = &[
    "dashboard-main",
    "dashboard-sidebar",
    "reports-overview",
];

/// Named component slots inside admin screens.
pub const KNOWN_COMPONENT_SLOTS: &[&str] = &[
    "admin-settings",
    "event-editor-toolbar",
    "attendee-list-actions",
];

/// Check if a name is one of the host's built-in extension points.
///
/// Unknown names still resolve (new points ship with host pages), this is
/// advisory for admin tooling.
pub fn is_known_extension_point(name: &str) -> bool {
    KNOWN_EXTENSION_POINTS.contains(&name)
}

/// A slot name that violates the naming rule.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid slot name: {0}")]
pub struct InvalidSlotName(pub String);

/// Validate a slot name in any namespace against `^[a-z][a-z0-9-]{1,63}$`.
///
/// Names must start with a lowercase ASCII letter and continue with
/// lowercase letters, digits, or hyphens; total length 2-64.
pub fn validate_slot_name(name: &str) -> Result<(), InvalidSlotName> {
    let len = name.len();
    if !(2..=64).contains(&len) {
        return Err(InvalidSlotName(format!(
            "must be 2-64 characters, got {len}"
        )));
    }

    let mut chars = name.chars();
    let first = chars.next().unwrap();
    if !first.is_ascii_lowercase() {
        return Err(InvalidSlotName(format!(
            "must start with a lowercase letter, got '{first}'"
        )));
    }

    for ch in chars {
        if !ch.is_ascii_lowercase() && !ch.is_ascii_digit() && ch != '-' {
            return Err(InvalidSlotName(format!("invalid character '{ch}'")));
        }
    }

    Ok(())
}

// ─── Typed contexts ─────────────────────────────────────────────────────

/// One line of a cart: a ticket type and quantity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub ticket_type_id: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

/// Immutable snapshot of the cart at render time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartSnapshot {
    pub lines: Vec<CartLine>,
    pub total_cents: i64,
    pub currency: String,
}

/// Context for the `payment-methods` point.
///
/// `return_url` is where the plugin sends the buyer after its provider
/// confirms payment; the host completes the order from there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentMethodsContext {
    pub cart: CartSnapshot,
    pub return_url: String,
}

/// Context for the `order-confirmation` point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderConfirmationContext {
    pub order_id: String,
    pub buyer_email: String,
    pub total_cents: i64,
    pub currency: String,
}

/// Context for the `ticket-detail-panel` point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketDetailContext {
    pub ticket_id: String,
    pub event_id: String,
    pub attendee_name: Option<String>,
}

/// Context for the `event-page-header` / `event-page-footer` points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPageContext {
    pub event_id: String,
    pub event_slug: String,
    pub starts_at: Option<String>,
}

/// Context for dashboard widget areas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DashboardContext {
    pub tenant_id: String,
    pub range_start: Option<String>,
    pub range_end: Option<String>,
}

// ─── Tests ──────────────────────────────────────────────────────────────
