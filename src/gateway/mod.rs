//! # Gateway Module
//!
//! The dispatcher entry point and the axum host that serves it.

pub mod dispatcher;
pub mod server;

pub use dispatcher::Dispatcher;
pub use server::DispatcherServer;
