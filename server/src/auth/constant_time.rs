use subtle::ConstantTimeEq;

/// Compare two byte strings without short-circuiting on the first differing
/// byte. Length is not secret, so a length mismatch returns immediately.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
