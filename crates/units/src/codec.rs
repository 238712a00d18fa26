//! Strict and lenient parsers for the canonical decimal wire form.

/// Upper bound on accepted input length. Guards the conversion below against
/// pathological inputs on persistence read paths.
pub const DEFAULT_MAX_WIRE_LEN: usize = 30;

#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("empty input")]
    Empty,
    #[error("plus sign is not canonical")]
    PlusSign,
    #[error("negative zero is not canonical")]
    NegativeZero,
    #[error("leading zeros are not canonical")]
    LeadingZero,
    #[error("expected a decimal digit")]
    InvalidDigit,
    #[error("input of {len} bytes exceeds the cap of {max}")]
    TooLong { len: usize, max: usize },
    #[error("value does not fit the target type")]
    Overflow,
    #[error("value out of range")]
    OutOfRange,
    #[error("whitespace is not permitted")]
    Whitespace,
}

/// Result of a lenient parse together with whether the input deviated from
/// the canonical form.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Lenient<T> {
    pub value: T,
    pub normalized: bool,
}

/// Parses the canonical wire form `^-?(0|[1-9][0-9]*)$`.
pub fn parse_canonical(input: &str, max_len: usize) -> Result<i128, ParseError> {
    if input.is_empty() {
        return Err(ParseError::Empty);
    }
    if input.len() > max_len {
        return Err(ParseError::TooLong {
            len: input.len(),
            max: max_len,
        });
    }
    if input.starts_with('+') {
        return Err(ParseError::PlusSign);
    }

    let (negative, digits) = match input.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, input),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidDigit);
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return Err(ParseError::LeadingZero);
    }
    if negative && digits == "0" {
        return Err(ParseError::NegativeZero);
    }

    let mut value: i128 = 0;
    for b in digits.bytes() {
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add(i128::from(b - b'0')))
            .ok_or(ParseError::Overflow)?;
    }
    Ok(if negative { -value } else { value })
}

/// Persistence read-path parser. Tries the strict form first, otherwise
/// tolerates surrounding whitespace, one leading plus, redundant leading
/// zeros and `-0`, and reports that it normalized.
pub fn parse_lenient(input: &str, max_len: usize) -> Result<Lenient<i128>, ParseError> {
    if let Ok(value) = parse_canonical(input, max_len) {
        return Ok(Lenient {
            value,
            normalized: false,
        });
    }

    let trimmed = input.trim();
    let unsigned = trimmed.strip_prefix('+').unwrap_or(trimmed);
    if unsigned.len() > max_len {
        return Err(ParseError::TooLong {
            len: unsigned.len(),
            max: max_len,
        });
    }
    let (negative, digits) = match unsigned.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, unsigned),
    };
    if digits.is_empty() {
        return Err(ParseError::InvalidDigit);
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidDigit);
    }

    let mut value: i128 = 0;
    for b in digits.bytes() {
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add(i128::from(b - b'0')))
            .ok_or(ParseError::Overflow)?;
    }
    Ok(Lenient {
        value: if negative { -value } else { value },
        normalized: true,
    })
}

/// Persistence write boundaries call this to catch non-canonical values
/// before they hit disk.
pub fn assert_canonical(input: &str) -> Result<(), ParseError> {
    parse_canonical(input, DEFAULT_MAX_WIRE_LEN).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_accepts_minimal_forms() {
        assert_eq!(parse_canonical("0", 30).unwrap(), 0);
        assert_eq!(parse_canonical("-1", 30).unwrap(), -1);
        assert_eq!(parse_canonical("10", 30).unwrap(), 10);
    }

    #[test]
    fn lenient_handles_negative_zero() {
        let parsed = parse_lenient("-0", 30).unwrap();
        assert_eq!(parsed.value, 0);
        assert!(parsed.normalized);
    }

    #[test]
    fn lenient_rejects_garbage() {
        assert!(parse_lenient("abc", 30).is_err());
        assert!(parse_lenient("1.5", 30).is_err());
        assert!(parse_lenient("", 30).is_err());
    }

    #[test]
    fn assert_canonical_rejects_padded_input() {
        assert!(assert_canonical("42").is_ok());
        assert!(assert_canonical(" 42").is_err());
    }
}
