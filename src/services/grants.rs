//! Issues expiring retrieval links for committed objects.

use crate::backend::{ObjectBackend, with_timeout};
use crate::models::upload::Grant;
use crate::services::error::{UploadError, UploadResult};
use chrono::Utc;
use std::{sync::Arc, time::Duration};

pub struct GrantIssuer {
    backend: Arc<dyn ObjectBackend>,
    default_ttl: Duration,
    max_ttl: Duration,
    timeout: Duration,
}

impl GrantIssuer {
    pub fn new(
        backend: Arc<dyn ObjectBackend>,
        default_ttl: Duration,
        max_ttl: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            backend,
            default_ttl,
            max_ttl,
            timeout,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// A link must live for at least a second and at most `max_ttl`.
    pub fn check_ttl(&self, ttl: Duration) -> UploadResult<()> {
        if ttl.as_secs() == 0 || ttl > self.max_ttl {
            return Err(UploadError::InvalidTtl {
                requested: ttl.as_secs(),
                max: self.max_ttl.as_secs(),
            });
        }
        Ok(())
    }

    pub async fn issue(&self, object_key: &str, ttl: Duration) -> UploadResult<Grant> {
        self.check_ttl(ttl)?;
        let lifetime = chrono::Duration::from_std(ttl).map_err(|_| UploadError::InvalidTtl {
            requested: ttl.as_secs(),
            max: self.max_ttl.as_secs(),
        })?;
        let expires_at = Utc::now() + lifetime;
        let url = with_timeout(
            self.timeout,
            "sign_url",
            self.backend.sign_url(object_key, ttl),
        )
        .await?;
        Ok(Grant { url, expires_at })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;

    fn issuer() -> GrantIssuer {
        GrantIssuer::new(
            Arc::new(MockBackend::new()),
            Duration::from_secs(3600),
            Duration::from_secs(7200),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn issues_future_expiry() {
        let grant = issuer()
            .issue("uploads/a.png", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(grant.url.starts_with("mock://uploads/a.png"));
        assert!(grant.expires_at > Utc::now());
    }

    #[tokio::test]
    async fn ttl_bounds_are_enforced() {
        let issuer = issuer();
        for ttl in [0, 7201] {
            let err = issuer
                .issue("k", Duration::from_secs(ttl))
                .await
                .unwrap_err();
            assert!(matches!(err, UploadError::InvalidTtl { max: 7200, .. }));
        }
        assert!(issuer.issue("k", Duration::from_secs(7200)).await.is_ok());
    }
}
