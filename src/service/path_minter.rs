//! Destination path minting.
//!
//! Minted keys are the synchronous half of the dispatch protocol: the key
//! returned to the client at accept time is exactly where the artifact will
//! land once the worker finishes. The local wall-clock timestamp plus a v4
//! uuid make each mint collision-free and roughly sortable by accept time.

use chrono::{DateTime, Local};
use uuid::Uuid;

/// Prefix under which all optimized artifacts are keyed.
pub const DESTINATION_PREFIX: &str = "optimized";

/// Mint a fresh destination key for the given format extension:
/// `optimized/{yyyy-MM-dd-HH-mm-ss-SSS}_{offset}_{uuid}.{format}`.
///
/// The timestamp is local wall clock; `offset` is the local UTC offset in
/// hours (`+02`) or hours-minutes (`+05:30`) form.
pub fn mint_destination_path(format: &str) -> String {
    mint_at(Local::now(), format)
}

fn mint_at(now: DateTime<Local>, format: &str) -> String {
    let stamp = now.format("%Y-%m-%d-%H-%M-%S-%3f");
    let offset = format_utc_offset(now.offset().local_minus_utc());
    format!(
        "{}/{}_{}_{}.{}",
        DESTINATION_PREFIX,
        stamp,
        offset,
        Uuid::new_v4(),
        format
    )
}

/// Render a UTC offset in seconds as `+HH` / `-HH`, or `+HH:MM` when the
/// offset is not a whole number of hours.
fn format_utc_offset(offset_seconds: i32) -> String {
    let sign = if offset_seconds < 0 { '-' } else { '+' };
    let total_minutes = offset_seconds.unsigned_abs() / 60;
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;

    if minutes == 0 {
        format!("{}{:02}", sign, hours)
    } else {
        format!("{}{:02}:{:02}", sign, hours, minutes)
    }
}

// =============================================================================
// Tests
// =============================================================================
