//! Password hashing: bcrypt for new hashes, with transparent upgrade from a
//! legacy MD5+salt scheme on successful login. Grounded literally in
//! `original_source/go-backend/pkg/password.go` and `pkg/md5.go`.

const LEGACY_MD5_SALT: &str = "admin_salt_2024";

pub fn hash_password(plain: &str) -> Result<String, bcrypt::BcryptError> {
    bcrypt::hash(plain, bcrypt::DEFAULT_COST)
}

fn md5_with_salt(plain: &str) -> String {
    use md5::{Digest, Md5};
    let mut hasher = Md5::new();
    hasher.update(plain.as_bytes());
    hasher.update(LEGACY_MD5_SALT.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn is_bcrypt_hash(hash: &str) -> bool {
    hash.starts_with("$2a$") || hash.starts_with("$2b$") || hash.starts_with("$2y$")
}

/// Verifies `plain` against `stored`, accepting either a bcrypt hash or the
/// legacy MD5+salt hash. Returns whether the password matched and, when a
/// legacy hash matched, the bcrypt hash the caller should rewrite it to.
pub struct VerifyOutcome {
    pub matches: bool,
    pub rehash: Option<String>,
}

pub fn verify_password(plain: &str, stored: &str) -> VerifyOutcome {
    if is_bcrypt_hash(stored) {
        let matches = bcrypt::verify(plain, stored).unwrap_or(false);
        return VerifyOutcome {
            matches,
            rehash: None,
        };
    }

    let matches = md5_with_salt(plain) == stored;
    let rehash = if matches {
        hash_password(plain).ok()
    } else {
        None
    };
    VerifyOutcome { matches, rehash }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bcrypt_roundtrip_verifies() {
        let hash = hash_password("correct horse").unwrap();
        assert!(is_bcrypt_hash(&hash));
        let outcome = verify_password("correct horse", &hash);
        assert!(outcome.matches);
        assert!(outcome.rehash.is_none());
    }

    #[test]
    fn legacy_md5_hash_verifies_and_requests_rehash() {
        let legacy = md5_with_salt("legacy-pass");
        let outcome = verify_password("legacy-pass", &legacy);
        assert!(outcome.matches);
        let rehashed = outcome.rehash.expect("legacy match should request rehash");
        assert!(is_bcrypt_hash(&rehashed));
        assert!(verify_password("legacy-pass", &rehashed).matches);
    }

    #[test]
    fn wrong_password_does_not_match_either_scheme() {
        let hash = hash_password("right").unwrap();
        assert!(!verify_password("wrong", &hash).matches);
        let legacy = md5_with_salt("right");
        assert!(!verify_password("wrong", &legacy).matches);
    }
}
