#[macro_use]
extern crate tracing;

pub mod builder;
pub mod bundle;
pub mod classify;
pub mod config;
pub mod digest;
pub mod error;
pub mod format;
pub mod hub;
pub mod layer;
pub mod manifest;
pub mod mediatype;
pub mod model;
pub mod progress;
pub mod reference;
pub mod store;
pub mod transport;

pub type Result<T> = std::result::Result<T, error::Error>;
