pub mod client;
pub mod protocol;

pub use client::EngineClient;
pub use protocol::{apply_routing_result, Message};
