//! Software crypto used by sessions, object pools and the simulated TPM
//!
//! - **cipher**: streaming DES / 3DES / AES in ECB, CBC and CBC-PAD
//! - **digest**: MD5 / SHA-1 / SHA-2 digest and HMAC state
//! - **seal**: authenticated blob encryption (AES-256-CBC + HMAC-SHA256)

pub mod cipher;
pub mod digest;
pub mod seal;

pub use self::cipher::BlockCipherState;
pub use self::digest::{digest, DigestState, HmacState};
pub use self::seal::{open_blob, seal_blob};

use rand::RngCore;

/// Random bytes from the OS RNG (used when no TPM is available)
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}
