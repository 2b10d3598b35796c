//! Index key composition.
//!
//! Composite keys join string fragments with a reserved single-byte
//! separator.  The separator is the lowest byte value, so a fragment prefix
//! followed by the separator sorts before every longer key sharing that
//! prefix, and [`KEY_END`] bounds a prefix scan from above (it can never
//! appear in UTF-8 fragment bytes).

/// Reserved separator byte. Must not appear in any key fragment.
pub const SEP: u8 = 0x00;

/// The separator as a one-character string, for composing keys in string
/// space.
pub const SEP_STR: &str = "\u{0}";

/// Upper-bound byte for prefix scans; never occurs in valid UTF-8.
pub const KEY_END: u8 = 0xff;

/// True when `fragment` may be composed into an index key.
pub fn fragment_ok(fragment: &str) -> bool {
    !fragment.bytes().any(|b| b == SEP)
}

/// Join fragments with the reserved separator.
pub fn composite(fragments: &[&str]) -> String {
    fragments.join(SEP_STR)
}

/// Lexicographically sortable fixed-width hex encoding of a sequence
/// number: the string order of encodings matches the integer order of
/// values.
pub fn hex_lexint(n: u64) -> String {
    format!("{n:016x}")
}
