//! HTTP adapter for the image transport port.

mod reqwest_transport;

pub use reqwest_transport::{DEFAULT_USER_AGENT, ReqwestTransport};
