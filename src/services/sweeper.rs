//! Background task that expires idle upload sessions.

use crate::services::upload_service::UploadService;
use std::time::Duration;
use tokio::{task::JoinHandle, time::interval};
use tracing::{debug, info};

pub struct ExpirySweeper {
    service: UploadService,
    every: Duration,
}

impl ExpirySweeper {
    pub fn new(service: UploadService, every: Duration) -> Self {
        Self { service, every }
    }

    /// Run the sweep loop until the handle is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run_loop().await })
    }

    async fn run_loop(&self) {
        let mut timer = interval(self.every);
        info!(interval = ?self.every, "expiry sweeper started");

        // first tick fires immediately
        timer.tick().await;

        loop {
            timer.tick().await;
            let expired = self.service.sweep_expired().await;
            if expired > 0 {
                info!(expired, "expired idle upload sessions");
            } else {
                debug!("no idle upload sessions");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::services::{
        commit::tests::fast_retry,
        error::UploadError,
        session::SessionSpec,
        upload_service::ServiceSettings,
        validator::UploadLimits,
    };
    use chrono::Utc;
    use std::sync::Arc;

    #[tokio::test]
    async fn sweeper_expires_overdue_sessions() {
        let backend = Arc::new(MockBackend::new());
        let service = UploadService::new(
            backend.clone(),
            ServiceSettings {
                limits: UploadLimits {
                    max_part_size: 16,
                    max_upload_size: 64,
                    allowed_content_types: vec!["text/plain".into()],
                },
                session_ttl: Duration::from_secs(3600),
                grant_ttl: Duration::from_secs(60),
                max_grant_ttl: Duration::from_secs(60),
                retry: fast_retry(),
            },
        );
        let session = service
            .create_session(SessionSpec {
                owner: "tester".into(),
                content_type: "text/plain".into(),
                total_size: 8,
                part_size: 8,
                filename: None,
                uploader_ip: None,
            })
            .await
            .unwrap();
        service
            .registry()
            .mutate(&session.id, |s| {
                s.expires_at = Utc::now() - chrono::Duration::seconds(1);
                Ok(())
            })
            .await
            .unwrap();

        let handle = ExpirySweeper::new(service.clone(), Duration::from_millis(20)).spawn();
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort();

        assert!(matches!(
            service.session(session.id).await,
            Err(UploadError::NotFound(_))
        ));
        assert_eq!(backend.state().aborted.len(), 1);
    }
}
