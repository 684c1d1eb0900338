//! WAL position arithmetic.
//!
//! PostgreSQL reports log-sequence numbers as `HEX/HEX` text, the two halves
//! being the high and low 32 bits of a byte offset into the WAL stream.

use anyhow::{Result, bail};

/// Convert an `X/Y` WAL position into an absolute byte offset.
///
/// # Errors
///
/// Returns an error if the input is not two `/`-separated hex halves of at
/// most 8 digits each.
pub fn convert_xlog_location_to_offset(location: &str) -> Result<u64> {
    let Some((high, low)) = location.split_once('/') else {
        bail!("invalid WAL location {location:?}, expected HEX/HEX");
    };

    if high.is_empty() || low.is_empty() || high.len() > 8 || low.len() > 8 {
        bail!("invalid WAL location {location:?}, expected HEX/HEX");
    }

    let high = u64::from_str_radix(high, 16)
        .map_err(|_| anyhow::anyhow!("invalid WAL location {location:?}, bad hex in high half"))?;
    let low = u64::from_str_radix(low, 16)
        .map_err(|_| anyhow::anyhow!("invalid WAL location {location:?}, bad hex in low half"))?;

    Ok((high << 32) | low)
}

/// Format an absolute byte offset back into the `X/Y` text form.
#[must_use]
pub fn format_xlog_location(offset: u64) -> String {
    format!("{:X}/{:X}", offset >> 32, offset & 0xFFFF_FFFF)
}
