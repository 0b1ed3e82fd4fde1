//! Phone number helpers for log output
//!
//! Numbers reach us inside SIP URIs (`sip:+905551234567@gateway`). They are
//! normalized to the E.164-without-plus form used across the platform and
//! must go through [`mask_phone`] before they are logged.

use std::sync::OnceLock;

use regex::Regex;

const VISIBLE_DIGITS: usize = 4;

fn sip_user_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"sip:(\+?[0-9][0-9\-\s]*)@").expect("static regex is valid"))
}

/// Extract and normalize the phone number from a SIP URI.
///
/// Returns `None` when the URI has no numeric user part.
pub fn extract_phone(uri: &str) -> Option<String> {
    let captures = sip_user_regex().captures(uri)?;
    let digits: String = captures[1].chars().filter(|c| c.is_ascii_digit()).collect();

    if digits.is_empty() {
        return None;
    }

    // Local formats: 0XXXXXXXXXX and bare 10-digit subscriber numbers
    if digits.len() == 11 && digits.starts_with('0') {
        return Some(format!("90{}", &digits[1..]));
    }
    if digits.len() == 10 && !digits.starts_with('9') {
        return Some(format!("90{}", digits));
    }

    Some(digits)
}

/// Replace all but the last four digits with `*`.
pub fn mask_phone(number: &str) -> String {
    let len = number.chars().count();
    if len <= VISIBLE_DIGITS {
        return "*".repeat(len);
    }

    number
        .chars()
        .enumerate()
        .map(|(i, c)| if i < len - VISIBLE_DIGITS { '*' } else { c })
        .collect()
}

/// Extract, normalize and mask in one step. Unparsable URIs are fully redacted.
pub fn masked_caller(uri: &str) -> String {
    match extract_phone(uri) {
        Some(number) => mask_phone(&number),
        None => "<redacted>".to_string(),
    }
}
