//! Network seam: request/response values, the `Network` trait and its
//! reqwest-backed implementation.

mod client;
mod error;
#[cfg(test)]
pub(crate) mod mock;
mod types;

pub use client::{HttpNetwork, Network};
pub use error::FetchError;
pub use types::{Headers, Method, Request, RequestMode, Response};
