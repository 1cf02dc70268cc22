//! Ratecord - Discord REST rate limiting
//!
//! This crate keeps a REST client under Discord's advertised rate limits.
//! Each route key maps to a bucket whose quota and reset time are learned
//! from response headers; a process-wide gate enforces global limits; and a
//! small table of suffix rules covers endpoints that are stricter than their
//! headers say.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod rest;

pub use error::{Error, Result};
