//! Password hashing and verification

use crate::Result;

/// Default bcrypt cost. Lowered in tests to keep the suite fast.
pub const DEFAULT_BCRYPT_COST: u32 = 10;

/// Hashes a password with bcrypt at the given cost.
///
/// The returned string embeds the salt and cost, so verification needs no
/// extra state.
pub fn hash_password(password: &str, cost: u32) -> Result<String> {
    Ok(bcrypt::hash(password, cost)?)
}

/// Verifies a password against a bcrypt digest.
pub fn verify_password(password: &str, hash: &str) -> Result<bool> {
    Ok(bcrypt::verify(password, hash)?)
}
