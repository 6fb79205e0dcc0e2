pub mod client;

pub use client::{build_client, ClientConfig};
