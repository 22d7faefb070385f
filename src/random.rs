//! Random identifiers and secrets.
//!
//! Job ids and session tokens both come from the OS entropy source. Job ids
//! are restricted to lowercase alphanumerics so they stay valid as container
//! names, Kubernetes object names, and URL path segments.

use rand::rngs::OsRng;
use rand::Rng;

/// Length of a job id.
pub const ID_LEN: usize = 12;

const ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const TOKEN_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Generate a new 12-character lowercase-alphanumeric id.
pub fn new_id() -> String {
    random_string(ID_CHARSET, ID_LEN)
}

/// Generate a random alphanumeric string of the given length, suitable for
/// bearer tokens and auth keys.
pub fn new_secure_string(len: usize) -> String {
    random_string(TOKEN_CHARSET, len)
}

fn random_string(charset: &[u8], len: usize) -> String {
    let mut rng = OsRng;
    (0..len)
        .map(|_| charset[rng.gen_range(0..charset.len())] as char)
        .collect()
}
