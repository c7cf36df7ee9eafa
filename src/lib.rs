//! Quotagate - Admin API Rate Limiting and Quota Enforcement
//!
//! This crate gates admin API requests per API key across four fixed
//! windows (10 seconds, minute, hour, day) plus a rolling daily quota.
//! All counters live in a shared store, so any number of stateless gate
//! instances can run side by side.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
