pub mod client;

pub use client::HttpBroker;
