//! Services hosted by the [`buspoller_service::ServiceManager`]
//!
//! - [`BusService`]: line observer and topology broadcaster over one link
//! - [`CommandService`]: command intake and telemetry reconciliation

mod bus;
mod commands;

pub use bus::*;
pub use commands::*;
