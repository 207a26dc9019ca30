//! Capture-time extraction from instrument file names.

use chrono::NaiveDateTime;

/// Formats tried against the timestamp portion of a file stem. Instruments
/// name files like `D20181101T142731.838206.bmp`; the fractional part is
/// optional.
const FORMATS: &[&str] = &["%Y%m%dT%H%M%S%.f", "%Y%m%dT%H%M%S"];

/// Parse a capture timestamp out of a file stem.
///
/// The stem is scanned for a 15-character-or-longer run shaped like
/// `YYYYmmddTHHMMSS[.ffffff]`, ignoring any alphabetic prefix (`D`, `PROC-`,
/// etc). Returns `None` when no such run exists.
pub fn timestamp_from_filename(stem: &str) -> Option<NaiveDateTime> {
    let bytes = stem.as_bytes();
    for start in 0..bytes.len() {
        if !bytes[start].is_ascii_digit() {
            continue;
        }
        if bytes.len() - start < 15 {
            break;
        }
        let candidate = &stem[start..];
        let end = candidate
            .char_indices()
            .find(|(i, c)| !(c.is_ascii_digit() || *c == '.' || (*i == 8 && *c == 'T')))
            .map(|(i, _)| i)
            .unwrap_or(candidate.len());
        let candidate = candidate[..end].trim_end_matches('.');
        for format in FORMATS {
            if let Ok(parsed) = NaiveDateTime::parse_from_str(candidate, format) {
                return Some(parsed);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn parses_fractional_instrument_stem() {
        let ts = timestamp_from_filename("D20181101T142731.838206").expect("timestamp");
        assert_eq!(
            (ts.year(), ts.month(), ts.day()),
            (2018, 11, 1),
            "date part"
        );
        assert_eq!((ts.hour(), ts.minute(), ts.second()), (14, 27, 31));
        assert_eq!(ts.and_utc().timestamp_subsec_micros(), 838_206);
    }

    #[test]
    fn parses_stem_without_fraction() {
        let ts = timestamp_from_filename("cam1-20240229T235959").expect("timestamp");
        assert_eq!((ts.year(), ts.month(), ts.day()), (2024, 2, 29));
        assert_eq!(ts.second(), 59);
    }

    #[test]
    fn rejects_stems_without_timestamp() {
        assert!(timestamp_from_filename("background").is_none());
        assert!(timestamp_from_filename("frame_0001").is_none());
    }
}
