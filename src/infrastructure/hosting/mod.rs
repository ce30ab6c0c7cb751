pub mod client;
#[cfg(test)]
pub mod memory;

pub use client::RestHostingClient;
