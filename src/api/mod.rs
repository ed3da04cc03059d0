//! HTTP surface consumed by the authoring UI

pub mod models;
pub mod rest;

pub use rest::router;
