//! Backend transports.

pub mod http;

pub use http::{ReqwestTransport, Transport, TransportEndpoint};
