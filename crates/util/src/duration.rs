//! Parsing for human-readable duration strings.
//!
//! Retry intervals and step timeouts are authored as strings such as
//! `100ms`, `5s`, `2m`, `1h`, or `1m30s`. Bare numbers are seconds.

use std::time::Duration;

/// Parse a duration string. Returns `None` for empty or malformed input.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    // Bare number: seconds.
    if let Ok(seconds) = trimmed.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut characters = trimmed.chars().peekable();
    let mut matched_any = false;

    while let Some(character) = characters.next() {
        if character.is_ascii_digit() {
            digits.push(character);
            continue;
        }
        if digits.is_empty() {
            return None;
        }
        let value: u64 = digits.parse().ok()?;
        digits.clear();

        let unit = match character {
            'm' if characters.peek() == Some(&'s') => {
                characters.next();
                Duration::from_millis(value)
            }
            's' => Duration::from_secs(value),
            'm' => Duration::from_secs(value * 60),
            'h' => Duration::from_secs(value * 3600),
            _ => return None,
        };
        total += unit;
        matched_any = true;
    }

    if !digits.is_empty() {
        // Trailing digits with no unit after an earlier unit: seconds.
        let value: u64 = digits.parse().ok()?;
        total += Duration::from_secs(value);
        matched_any = true;
    }

    matched_any.then_some(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_unit_values() {
        assert_eq!(parse_duration("100ms"), Some(Duration::from_millis(100)));
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn bare_numbers_are_seconds() {
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
    }

    #[test]
    fn parses_compound_values() {
        assert_eq!(parse_duration("1m30s"), Some(Duration::from_secs(90)));
        assert_eq!(
            parse_duration("1s500ms"),
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("abc"), None);
        assert_eq!(parse_duration("10x"), None);
        assert_eq!(parse_duration("ms"), None);
    }
}
