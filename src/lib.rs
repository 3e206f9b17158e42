//! Spillway - Distributed Admission Control with Overflow Queueing
//!
//! This crate implements a per-client admission gate that enforces a burst
//! and a sustained rate limit against a shared counting store. Requests that
//! exceed either budget are not dropped: they are queued durably and executed
//! later by a deferred worker, outside any rate-limit window.

pub mod admission;
pub mod config;
pub mod error;
pub mod queue;
pub mod ratelimit;
pub mod worker;
