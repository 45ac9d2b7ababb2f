//! Bus Poller
//!
//! Host side of a shared half-duplex serial bus:
//! - Line observer: registers self-announcing devices and flags replies
//! - Topology broadcaster: grants the bus with a roster/time-sync broadcast,
//!   then polls each device in turn
//! - Command reconciliation: confirms commands from later telemetry
//!
//! Long-running parts are hosted as services via `buspoller_service`.

// Re-export the service runtime
pub use buspoller_service;

// Device identity and roster
pub mod device;
pub mod registry;

// Wire formats
pub mod frame;
pub mod topology;

// Serial link transport
pub mod link;

// Bus scheduling
pub mod broadcaster;
pub mod observer;
pub mod signal;

// Command convergence
pub mod reconcile;

pub mod config;
pub mod error;
pub mod services;
