//! Dispatcher -- scheduling decisions, timers, and result consumption.
//!
//! Split into focused submodules:
//! - `core`: Dispatcher struct, constructor, and accessor methods
//! - `scheduling`: schedule_once / schedule_periodic / cancel
//! - `execution`: dispatch routing, timer firing, draining results, shutdown

mod core;
mod execution;
mod scheduling;
#[cfg(test)]
mod tests;

pub use self::core::Dispatcher;
