pub mod attention;
pub mod automation;
pub mod catalog;
pub mod config;
pub mod controller;
pub mod error;
pub mod event_bus;
pub mod events;
pub mod helpers;
pub mod layout;
pub mod lifecycle;
pub mod planner;
pub mod protocol;
pub mod pty;
pub mod reconcile;
pub mod store;
#[cfg(unix)]
pub mod wrap;
