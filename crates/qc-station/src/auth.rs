use std::fmt;

use tracing::debug;
use zeroize::Zeroizing;

/// Configured secret; wiped from memory on drop.
#[derive(Clone)]
pub struct ApiKey(Zeroizing<Vec<u8>>);

impl ApiKey {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self(Zeroizing::new(secret.into()))
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(..)")
    }
}

/// Internal reason only; callers always see a plain 401.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthRejection {
    #[error("no API key configured on the server")]
    NotConfigured,
    #[error("request carried no API key")]
    Missing,
    #[error("API key mismatch")]
    Mismatch,
}

/// Length first, then XOR-accumulate over every byte.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Debug, Clone)]
pub struct AuthGate {
    key: Option<ApiKey>,
}

impl AuthGate {
    /// An empty secret counts as unconfigured and rejects everything.
    pub fn new(secret: Option<String>) -> Self {
        Self {
            key: secret.filter(|s| !s.is_empty()).map(ApiKey::new),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.key.is_some()
    }

    pub fn verify(&self, presented: Option<&[u8]>) -> Result<(), AuthRejection> {
        let outcome = match (&self.key, presented) {
            (None, _) => Err(AuthRejection::NotConfigured),
            (Some(_), None) => Err(AuthRejection::Missing),
            (Some(_), Some(p)) if p.is_empty() => Err(AuthRejection::Missing),
            (Some(key), Some(p)) if constant_time_eq(key.as_bytes(), p) => Ok(()),
            (Some(_), Some(_)) => Err(AuthRejection::Mismatch),
        };
        if let Err(reason) = &outcome {
            debug!(%reason, "api key rejected");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparison() {
        assert!(constant_time_eq(b"", b""));
        assert!(constant_time_eq(b"s3cret", b"s3cret"));
        assert!(!constant_time_eq(b"s3cret", b"s3cres"));
        assert!(!constant_time_eq(b"s3cret", b"s3cret!"));
        assert!(!constant_time_eq(b"S3cret", b"s3cret"));
    }

    #[test]
    fn gate_outcomes() {
        let gate = AuthGate::new(Some("station-key".into()));
        assert!(gate.is_configured());
        assert_eq!(gate.verify(Some(b"station-key")), Ok(()));
        assert_eq!(gate.verify(Some(b"station-kez")), Err(AuthRejection::Mismatch));
        assert_eq!(gate.verify(Some(b"station")), Err(AuthRejection::Mismatch));
        assert_eq!(gate.verify(Some(b"")), Err(AuthRejection::Missing));
        assert_eq!(gate.verify(None), Err(AuthRejection::Missing));
    }

    #[test]
    fn unconfigured_gate_rejects_everything() {
        for gate in [AuthGate::new(None), AuthGate::new(Some(String::new()))] {
            assert!(!gate.is_configured());
            assert_eq!(gate.verify(Some(b"")), Err(AuthRejection::NotConfigured));
            assert_eq!(gate.verify(Some(b"anything")), Err(AuthRejection::NotConfigured));
            assert_eq!(gate.verify(None), Err(AuthRejection::NotConfigured));
        }
    }

    #[test]
    fn debug_hides_secret() {
        let gate = AuthGate::new(Some("hunter2".into()));
        assert!(!format!("{:?}", gate).contains("hunter2"));
    }
}
