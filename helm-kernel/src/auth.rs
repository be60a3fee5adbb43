//! Request authentication shape. `helm-kernel` defines the claims contract
//! and which paths bypass it; verifying the bearer JWT itself is an HTTP-layer
//! concern outside this repo's scope (`SPEC_FULL.md` §1).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub tenant_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub exp: i64,
    pub iat: i64,
    pub iss: String,
}

impl Claims {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn is_expired(&self, now_unix: i64) -> bool {
        now_unix >= self.exp
    }
}

/// Path prefixes that never require a bearer token: health checks and the
/// conformance report a tenant fetches with its own evidence-pack signature,
/// not a session token.
pub const PUBLIC_PATH_PREFIXES: &[&str] = &["/healthz", "/readyz", "/conform/verify"];

pub fn is_public_path(path: &str) -> bool {
    PUBLIC_PATH_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthz_is_public() {
        assert!(is_public_path("/healthz"));
        assert!(!is_public_path("/v1/runs"));
    }

    #[test]
    fn expiry_check() {
        let claims = Claims {
            sub: "agent1".into(),
            tenant_id: "t1".into(),
            roles: vec!["operator".into()],
            exp: 1000,
            iat: 900,
            iss: "helm".into(),
        };
        assert!(claims.is_expired(1000));
        assert!(!claims.is_expired(999));
        assert!(claims.has_role("operator"));
    }
}
