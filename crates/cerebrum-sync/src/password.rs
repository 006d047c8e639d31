//! Initial passwords for new accounts.
//!
//! Only the argon2 PHC string is stored. The plaintext is dropped once it
//! has been hashed; users get a new one through the password service.

use argon2::{Argon2, PasswordHasher, password_hash::SaltString};
use rand_core::{OsRng, RngCore as _};

use crate::{Error, Result};

// No look-alikes (0/O, 1/l/I).
const ALPHABET: &[u8] = b"abcdefghijkmnpqrstuvwxyzABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const LENGTH: usize = 12;

pub fn generate() -> String {
  (0..LENGTH)
    .map(|_| {
      let i = OsRng.next_u32() as usize % ALPHABET.len();
      ALPHABET[i] as char
    })
    .collect()
}

pub fn hash(password: &str) -> Result<String> {
  let salt = SaltString::generate(&mut OsRng);
  Ok(
    Argon2::default()
      .hash_password(password.as_bytes(), &salt)
      .map_err(|e| Error::Password(e.to_string()))?
      .to_string(),
  )
}

#[cfg(test)]
mod tests {
  use argon2::{PasswordHash, PasswordVerifier as _};

  use super::*;

  #[test]
  fn generated_passwords_use_the_alphabet() {
    let pw = generate();
    assert_eq!(pw.len(), LENGTH);
    assert!(pw.bytes().all(|b| ALPHABET.contains(&b)));
    assert_ne!(generate(), generate());
  }

  #[test]
  fn hash_verifies() {
    let h = hash("s3cret").unwrap();
    assert!(h.starts_with("$argon2"));
    let parsed = PasswordHash::new(&h).unwrap();
    assert!(Argon2::default().verify_password(b"s3cret", &parsed).is_ok());
    assert!(Argon2::default().verify_password(b"other", &parsed).is_err());
  }
}
