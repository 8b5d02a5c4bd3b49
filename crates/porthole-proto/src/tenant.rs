//! Tenant identifier validation and generation.
//!
//! A tenant id is the routing key for a tunnel: 3–63 characters, lowercase
//! alphanumeric plus interior hyphens (the DNS-label shape, so it can appear
//! as a subdomain unchanged).

use rand::Rng;

/// Invalid tenant identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TenantIdError {
    #[error("tenant id must be 3-63 characters, got {0}")]
    Length(usize),

    #[error("tenant id contains invalid character {0:?}")]
    Character(char),

    #[error("tenant id must start and end with a letter or digit")]
    Edge,
}

/// Lowercase a requested tenant id. All registry keys are case-folded.
pub fn normalize_tenant_id(id: &str) -> String {
    id.to_ascii_lowercase()
}

/// Check a (normalized) tenant id against the identifier rules.
pub fn validate_tenant_id(id: &str) -> Result<(), TenantIdError> {
    let bytes = id.as_bytes();
    if bytes.len() < 3 || bytes.len() > 63 {
        return Err(TenantIdError::Length(bytes.len()));
    }

    for &b in bytes {
        if !(b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-') {
            return Err(TenantIdError::Character(b as char));
        }
    }

    if bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' {
        return Err(TenantIdError::Edge);
    }

    Ok(())
}

const ADJECTIVES: &[&str] = &[
    "bold", "calm", "eager", "fond", "glad", "keen", "kind", "lively", "merry", "neat", "proud",
    "quick", "quiet", "sly", "snug", "spry", "swift", "tidy", "warm", "wise",
];

const ANIMALS: &[&str] = &[
    "bat", "bear", "crab", "crow", "deer", "fox", "hare", "heron", "lark", "lynx", "mole",
    "newt", "otter", "owl", "seal", "stoat", "swan", "toad", "vole", "wren",
];

/// Generate a memorable tenant id of the form `bold-owl-716`.
pub fn generate_tenant_id() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "{}-{}-{}",
        ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())],
        ANIMALS[rng.gen_range(0..ANIMALS.len())],
        rng.gen_range(100..1000)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_ids() {
        for id in ["abc", "myapp", "bold-owl-716", "a-b-c", "000", "x0y"] {
            assert_eq!(validate_tenant_id(id), Ok(()), "{id}");
        }
        // Boundary lengths.
        assert_eq!(validate_tenant_id(&"a".repeat(63)), Ok(()));
    }

    #[test]
    fn rejects_invalid_ids() {
        assert!(matches!(validate_tenant_id("ab"), Err(TenantIdError::Length(2))));
        assert!(matches!(
            validate_tenant_id(&"a".repeat(64)),
            Err(TenantIdError::Length(64))
        ));
        assert!(matches!(validate_tenant_id("-abc"), Err(TenantIdError::Edge)));
        assert!(matches!(validate_tenant_id("abc-"), Err(TenantIdError::Edge)));
        assert!(matches!(
            validate_tenant_id("my_app"),
            Err(TenantIdError::Character('_'))
        ));
        assert!(matches!(
            validate_tenant_id("My-App"),
            Err(TenantIdError::Character('M'))
        ));
        assert!(matches!(
            validate_tenant_id("my.app"),
            Err(TenantIdError::Character('.'))
        ));
    }

    #[test]
    fn normalization_folds_case() {
        assert_eq!(normalize_tenant_id("ABCdef"), "abcdef");
        assert_eq!(validate_tenant_id(&normalize_tenant_id("ABCdef")), Ok(()));
    }

    #[test]
    fn generated_ids_validate() {
        for _ in 0..64 {
            let id = generate_tenant_id();
            assert_eq!(validate_tenant_id(&id), Ok(()), "{id}");
        }
    }
}
