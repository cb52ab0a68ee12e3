//! Utility functions and helpers

use crate::error::{ChainmeshError, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;

/// Current Unix time in seconds
pub fn current_time_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Parse a size such as `512`, `4k`, `1.5m` or `1g` into bytes
pub fn parse_size(text: &str) -> Result<usize> {
    let text = text.trim().to_ascii_lowercase();
    let invalid = || ChainmeshError::config(format!("invalid size: {:?}", text));

    let (number, unit) = match text.char_indices().find(|(_, c)| c.is_ascii_alphabetic()) {
        Some((index, _)) => text.split_at(index),
        None => (text.as_str(), ""),
    };
    let multiplier: f64 = match unit.trim_end_matches(['b', 'i']) {
        "" => 1.0,
        "k" => 1024.0,
        "m" => 1024.0 * 1024.0,
        "g" => 1024.0 * 1024.0 * 1024.0,
        _ => return Err(invalid()),
    };
    let value: f64 = number.trim().parse().map_err(|_| invalid())?;
    if !value.is_finite() || value < 0.0 {
        return Err(invalid());
    }
    Ok((value * multiplier) as usize)
}

/// Random alphanumeric bytes, used for generated block payloads
pub fn random_payload(size: usize) -> Vec<u8> {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(size)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("4k").unwrap(), 4096);
        assert_eq!(parse_size("4KB").unwrap(), 4096);
        assert_eq!(parse_size("1.5m").unwrap(), 1_572_864);
        assert_eq!(parse_size("2MiB").unwrap(), 2 * 1024 * 1024);
        assert!(parse_size("").is_err());
        assert!(parse_size("ten").is_err());
        assert!(parse_size("3x").is_err());
    }

    #[test]
    fn test_random_payload() {
        let payload = random_payload(64);
        assert_eq!(payload.len(), 64);
        assert!(payload.iter().all(u8::is_ascii_alphanumeric));
    }
}
