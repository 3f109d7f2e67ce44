pub mod time_utils;

pub use time_utils::{format_iso, now_iso, parse_iso, wall_clock_now};
