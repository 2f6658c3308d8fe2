//! `service_id` generation.
//!
//! Wraps an `xid::new()` and folds it down to 4 bytes of hex for a short,
//! opaque 8-char id — still effectively unique per process, but matching
//! the shape clients are expected to see.

use std::fmt::Write as _;

/// Generates a new opaque 8-hex-char service id.
pub fn new_service_id() -> String {
    let raw = xid::new().to_string();
    let mut hash: u32 = 0x811c_9dc5; // FNV-1a offset basis
    for b in raw.as_bytes() {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    let mut out = String::with_capacity(8);
    write!(out, "{hash:08x}").expect("writing to String never fails");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_eight_hex_chars() {
        let id = new_service_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn is_not_constant() {
        let a = new_service_id();
        let b = new_service_id();
        assert_ne!(a, b);
    }
}
