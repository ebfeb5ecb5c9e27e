//! Catalog domain: remote gateway, record normalization, the count
//! projection, view derivation and the service facade tying them together.

pub mod api_types;
pub mod cache;
pub mod client;
pub mod counts;
pub mod service;
pub mod types;
pub mod view;
