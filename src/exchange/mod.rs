//! Exchange REST access

mod client;

pub use client::{ExchangeClient, VolumeEntry};
