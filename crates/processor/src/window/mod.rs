//! Windowing module for stream processing
//!
//! Events are bucketed into tumbling windows: fixed-size, non-overlapping
//! windows where each event belongs to exactly one window.
//!
//! ```text
//! Time:     0----60---120--180--240
//! Windows:  [---)[---)[---)[---)
//! ```
//!
//! A window starts at `floor(t / size) * size`. It fires once the watermark
//! passes `end + allowed_lateness`.
//!
//! # Example Usage
//!
//! ```rust
//! use processor::window::{TumblingWindowAssigner, WindowAssigner};
//! use chrono::{Duration, TimeZone, Utc};
//!
//! let assigner = TumblingWindowAssigner::new(Duration::minutes(1));
//! let windows = assigner.assign_windows(Utc.timestamp_millis_opt(61_000).unwrap());
//! assert_eq!(windows[0].start.timestamp_millis(), 60_000);
//! ```

pub mod assigner;
pub mod types;

pub use assigner::{TumblingWindowAssigner, WindowAssigner};
pub use types::{WindowBounds, WindowKey};
