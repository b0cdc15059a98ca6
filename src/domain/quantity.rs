//! Kubernetes resource quantity parsing
//!
//! Claims report storage as quantity strings ("10Gi", "500M", "1e9"). Binary
//! suffixes are powers of 1024, decimal suffixes are powers of 1000.

use crate::error::{Error, Result};

const BINARY_SUFFIXES: [(&str, u64); 6] = [
    ("Ki", 1 << 10),
    ("Mi", 1 << 20),
    ("Gi", 1 << 30),
    ("Ti", 1 << 40),
    ("Pi", 1 << 50),
    ("Ei", 1 << 60),
];

const DECIMAL_SUFFIXES: [(&str, u64); 6] = [
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
    ("P", 1_000_000_000_000_000),
    ("E", 1_000_000_000_000_000_000),
];

/// Parse a quantity string (e.g., "100Gi", "1T", "1048576") to bytes
pub fn parse_quantity(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::CapacityParse("empty quantity string".into()));
    }

    // Binary suffixes first: "Mi" must not be read as "M" followed by garbage
    for (suffix, factor) in BINARY_SUFFIXES.iter().chain(DECIMAL_SUFFIXES.iter()) {
        if let Some(num_str) = s.strip_suffix(suffix) {
            let num: f64 = num_str
                .parse()
                .map_err(|_| Error::CapacityParse(format!("invalid number: {}", num_str)))?;
            return to_bytes(num * *factor as f64, s);
        }
    }

    // Plain number, possibly with a decimal exponent ("1e9")
    let num: f64 = s
        .parse()
        .map_err(|_| Error::CapacityParse(format!("unknown quantity: {}", s)))?;
    to_bytes(num, s)
}

fn to_bytes(value: f64, raw: &str) -> Result<u64> {
    if !value.is_finite() || value < 0.0 {
        return Err(Error::CapacityParse(format!("out of range: {}", raw)));
    }
    // Fractional bytes round up, like the API server does for storage
    Ok(value.ceil() as u64)
}

/// Render bytes as a quantity string accepted by the API server
pub fn format_quantity(bytes: u64) -> String {
    bytes.to_string()
}
