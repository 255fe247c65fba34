//! Tessera Plugin Component Contract
//!
//! The minimal, version-stable surface shared between the Tessera host and
//! independently built plugin bundles. A plugin bundle exposes one renderable
//! component per extension point it implements; every component receives
//! exactly three named inputs — `context`, `configuration`, `plugin` — and
//! returns a rendered fragment. Host releases and plugin bundles compile
//! against this crate separately and stay compatible as long as this shape
//! is preserved.

pub mod contract;
pub mod points;

pub use contract::{
    export_name, Component, ComponentError, ComponentHandle, ComponentInvocation, PluginConfig,
    PluginIdentity, RenderedFragment,
};
pub use points::{
    is_known_extension_point, validate_slot_name, CartLine, CartSnapshot, DashboardContext,
    EventPageContext, InvalidSlotName, OrderConfirmationContext, PaymentMethodsContext,
    TicketDetailContext, KNOWN_COMPONENT_SLOTS, KNOWN_EXTENSION_POINTS, KNOWN_WIDGET_AREAS,
};
