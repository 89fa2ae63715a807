//! Core types for the ad-exchange stream aggregator
//!
//! This crate holds the wire-level data structures shared by the processor
//! and the command-line tool: the five ad-exchange event types and the
//! per-window aggregated result that is published downstream.

pub mod events;
pub mod results;

pub use events::{AdEvent, BidRequest, BidResponse, Click, EventKind, Impression, WinNotification};
pub use results::AggregatedResult;
