//! Offline resilience layer for a booking client.
//!
//! Every request goes through the [`interceptor::Interceptor`]: reads are
//! served by the cache strategy engine, writes that cannot reach the
//! server are persisted in the mutation queue and replayed once the
//! connection returns.

pub mod app;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod interceptor;
pub mod net;
pub mod queue;
pub mod runtime;
