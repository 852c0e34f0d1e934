//! Outbound HTTP plumbing shared by the upstream dispatcher and the health prober.

pub mod client;

pub use client::{HttpClient, HttpClientBuilder};
