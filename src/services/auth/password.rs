//! Password hash verification for the account records owned by the user service.
//!
//! Accepted stored formats:
//! - bcrypt (`$2a$`, `$2b$`, `$2y$`), as written by the user-administration service
//! - Argon2 PHC strings (`$argon2id$...`), for accounts re-hashed since
//!
//! Both are CPU-bound by design; call from a blocking context.
use argon2::{Argon2, PasswordHash, PasswordVerifier};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Bcrypt,
    Argon2,
}

fn scheme_of(stored: &str) -> Option<Scheme> {
    if ["$2a$", "$2b$", "$2y$"].iter().any(|p| stored.starts_with(p)) {
        Some(Scheme::Bcrypt)
    } else if stored.starts_with("$argon2") {
        Some(Scheme::Argon2)
    } else {
        None
    }
}

/// Check `password` against a stored hash. Unknown schemes and malformed hashes never verify.
pub fn verify_password(stored: &str, password: &str) -> bool {
    match scheme_of(stored) {
        Some(Scheme::Bcrypt) => bcrypt::verify(password, stored).unwrap_or_else(|e| {
            warn!(error = %e, "unreadable bcrypt hash");
            false
        }),
        Some(Scheme::Argon2) => match PasswordHash::new(stored) {
            Ok(parsed) => Argon2::default()
                .verify_password(password.as_bytes(), &parsed)
                .is_ok(),
            Err(e) => {
                warn!(error = %e, "unreadable argon2 hash");
                false
            }
        },
        None => {
            warn!("unsupported password hash scheme");
            false
        }
    }
}
