//! Floodgate - Admission Control for Artifact Repository Servers
//!
//! This crate decides, per incoming request, whether the request may proceed.
//! Limits are configured per resource (URL prefix, repository, user) and per
//! dimension (request count, bytes uploaded or downloaded), evaluated with
//! fixed-window, leaky-bucket or token-bucket algorithms, and backed either by
//! in-process counters or by a shared counter store.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod ratelimit;
