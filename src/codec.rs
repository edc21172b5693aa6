//! Decoding of the panic button's notification payloads.
//!
//! Payloads arrive as base64 text. Decoding is lenient: characters outside the
//! base64 alphabet are dropped before grouping and `=` padding may be present
//! or missing.

use base64::Engine as _;
use base64::alphabet;
use base64::engine::general_purpose::STANDARD;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};

/// Token the firmware sends when the button is pressed.
pub const SOS_TOKEN: &str = "SOS";
/// Alternate trigger accepted anywhere in the payload.
pub const ALT_TRIGGER: char = '1';

const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

fn in_alphabet(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'+' || b == b'/'
}

pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a base64 payload into raw bytes. Never fails; a trailing
/// character that cannot complete a byte is ignored.
pub fn decode(payload: &str) -> Vec<u8> {
    let mut cleaned: Vec<u8> = payload.bytes().filter(|b| in_alphabet(*b)).collect();
    if cleaned.len() % 4 == 1 {
        cleaned.pop();
    }
    LENIENT.decode(&cleaned).unwrap_or_default()
}

/// Decode a payload into text, mapping each byte to the code point of the
/// same value so arbitrary firmware bytes survive.
pub fn decode_text(payload: &str) -> String {
    decode(payload).into_iter().map(char::from).collect()
}

/// Whether a decoded payload is a panic signal.
///
/// Any `'1'` anywhere in the text also counts. This matches deployed
/// firmware behaviour and misfires on payloads such as counters; it is kept
/// until product decides otherwise.
pub fn is_sos(text: &str) -> bool {
    text.contains(SOS_TOKEN) || text.contains(ALT_TRIGGER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_all_lengths() {
        let data: Vec<u8> = (0u8..=255).collect();
        for len in [0, 1, 2, 3, 4, 5, 6, 20, 255, 256] {
            let bytes = &data[..len];
            assert_eq!(decode(&encode(bytes)), bytes, "length {len}");
        }
    }

    #[test]
    fn test_decode_tolerates_missing_padding() {
        assert_eq!(decode("U09T"), b"SOS");
        assert_eq!(decode("TQ=="), b"M");
        assert_eq!(decode("TQ"), b"M");
        assert_eq!(decode("TWE"), b"Ma");
    }

    #[test]
    fn test_decode_strips_foreign_characters() {
        assert_eq!(decode("U0\n9T"), b"SOS");
        assert_eq!(decode(" U-0_9*T "), b"SOS");
    }

    #[test]
    fn test_decode_ignores_dangling_character() {
        assert_eq!(decode("U09TQ"), b"SOS");
    }

    #[test]
    fn test_decode_text_keeps_high_bytes() {
        let text = decode_text(&encode(&[0x53, 0xff]));
        assert_eq!(text, "S\u{ff}");
    }

    #[test]
    fn test_is_sos() {
        assert!(is_sos("SOS"));
        assert!(is_sos("x1y"));
        assert!(is_sos("BTN:SOS:2"));
        assert!(!is_sos("ok"));
        assert!(!is_sos("sos"));
        assert!(!is_sos(""));
    }
}
