pub mod client;
#[cfg(test)]
pub mod scripted;

pub use client::Git2MirrorClient;
