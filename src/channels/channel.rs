//! SMS channel trait, correlation data and segment accounting.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::dispatch::NormalizedAddress;
use crate::error::ChannelError;

/// Data attached to a transmission so its completion signal can be routed
/// back to the originating job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    pub job_id: String,
    pub account_id: String,
    pub address: String,
}

/// A physical transmission path.
///
/// `transmit` reports the immediate accept/reject. The delivery result
/// arrives later as a completion signal carrying the same correlation.
#[async_trait]
pub trait SmsChannel: Send + Sync {
    /// Get the channel name.
    fn name(&self) -> &str;

    /// Issue one transmission. Returns the number of parts sent.
    async fn transmit(
        &self,
        address: &NormalizedAddress,
        body: &str,
        correlation: &Correlation,
    ) -> Result<usize, ChannelError>;
}

/// Characters in the GSM 03.38 default alphabet.
const GSM7_BASIC: &str = "@£$¥èéùìòÇ\nØø\rÅåΔ_ΦΓΛΩΠΨΣΘΞÆæßÉ !\"#¤%&'()*+,-./0123456789:;<=>?\
¡ABCDEFGHIJKLMNOPQRSTUVWXYZÄÖÑÜ§¿abcdefghijklmnopqrstuvwxyzäöñüà";

/// Characters reached through the GSM escape, costing two septets.
const GSM7_EXTENDED: &str = "^{}\\[~]|€\u{0C}";

/// Body encoding chosen for transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentEncoding {
    Gsm7,
    Ucs2,
}

impl SegmentEncoding {
    fn single_limit(self) -> usize {
        match self {
            Self::Gsm7 => 160,
            Self::Ucs2 => 70,
        }
    }

    /// Per-part limit once a user data header is needed.
    fn multipart_limit(self) -> usize {
        match self {
            Self::Gsm7 => 153,
            Self::Ucs2 => 67,
        }
    }
}

/// Pick an encoding and count its units (septets or UTF-16 code units).
pub fn encoding_units(body: &str) -> (SegmentEncoding, usize) {
    let mut septets = 0;
    for c in body.chars() {
        if GSM7_BASIC.contains(c) {
            septets += 1;
        } else if GSM7_EXTENDED.contains(c) {
            septets += 2;
        } else {
            return (SegmentEncoding::Ucs2, body.encode_utf16().count());
        }
    }
    (SegmentEncoding::Gsm7, septets)
}

/// Number of SMS parts needed for `body`. Never zero.
pub fn segment_count(body: &str) -> usize {
    let (encoding, units) = encoding_units(body);
    if units <= encoding.single_limit() {
        1
    } else {
        units.div_ceil(encoding.multipart_limit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_bodies_are_one_part() {
        assert_eq!(segment_count(""), 1);
        assert_eq!(segment_count("hi"), 1);
        assert_eq!(segment_count(&"a".repeat(160)), 1);
    }

    #[test]
    fn gsm_multipart_uses_153() {
        assert_eq!(segment_count(&"a".repeat(161)), 2);
        assert_eq!(segment_count(&"a".repeat(306)), 2);
        assert_eq!(segment_count(&"a".repeat(307)), 3);
    }

    #[test]
    fn extended_chars_cost_two_septets() {
        let (encoding, units) = encoding_units("{}");
        assert_eq!(encoding, SegmentEncoding::Gsm7);
        assert_eq!(units, 4);
        assert_eq!(segment_count(&"€".repeat(80)), 1);
        assert_eq!(segment_count(&"€".repeat(81)), 2);
    }

    #[test]
    fn non_gsm_switches_to_ucs2() {
        let (encoding, _) = encoding_units("नमस्ते");
        assert_eq!(encoding, SegmentEncoding::Ucs2);
        assert_eq!(segment_count(&"あ".repeat(70)), 1);
        assert_eq!(segment_count(&"あ".repeat(71)), 2);
        assert_eq!(segment_count(&"あ".repeat(135)), 3);
    }
}
