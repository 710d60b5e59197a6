use crate::extractor::CommandExtractor;
use crate::store::SqliteStore;
use chrono::{DateTime, Utc};
use facegate_core::{EnrollmentError, EnrollmentService, HmacCredentialIssuer, Identity, IdentityId};
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;

pub type Service = EnrollmentService<SqliteStore, CommandExtractor, HmacCredentialIssuer>;

/// Administrative view of a quarantined face. Descriptors are not exposed.
#[derive(Debug, Serialize)]
struct UnknownFace {
    id: IdentityId,
    display_name: String,
    created_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
    attempts: usize,
}

impl From<Identity> for UnknownFace {
    fn from(identity: Identity) -> Self {
        Self {
            id: identity.id,
            display_name: identity.display_name,
            created_at: identity.created_at,
            last_seen_at: identity.last_seen_at,
            attempts: identity.attempt_log.len(),
        }
    }
}

/// D-Bus interface for the Facegate identity daemon.
///
/// Bus name: org.freedesktop.Facegate1
/// Object path: /org/freedesktop/Facegate1
///
/// Outcomes are returned as JSON objects tagged by `status`. Collaborator
/// failures surface as `org.freedesktop.DBus.Error.Failed` prefixed with
/// `service_unavailable:` so callers can retry with backoff.
pub struct FacegateService {
    service: Arc<Service>,
}

impl FacegateService {
    pub fn new(service: Arc<Service>) -> Self {
        Self { service }
    }
}

fn unavailable(err: EnrollmentError) -> zbus::fdo::Error {
    tracing::error!(error = %err, "request failed");
    zbus::fdo::Error::Failed(format!("{}: {err}", err.code()))
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.freedesktop.Facegate1")]
impl FacegateService {
    /// Resolve a face image to a user, a quarantine record, or a rejection.
    async fn verify(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(bytes = image.len(), "verify requested");
        let outcome = self.service.verify(image).await.map_err(unavailable)?;
        to_json(&outcome)
    }

    /// Register a user. `quarantine_id` may be empty.
    async fn register(
        &self,
        display_name: &str,
        contact: &str,
        image: Vec<u8>,
        quarantine_id: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(bytes = image.len(), quarantine_id, "register requested");
        let quarantine_id = match quarantine_id {
            "" => None,
            raw => Some(raw.parse::<IdentityId>().map_err(|e| {
                zbus::fdo::Error::InvalidArgs(format!("invalid quarantine id: {e}"))
            })?),
        };
        let outcome = self
            .service
            .register(display_name, contact, image, quarantine_id)
            .await
            .map_err(unavailable)?;
        to_json(&outcome)
    }

    /// List quarantined faces, newest first. `limit` 0 means the configured default.
    async fn list_unknown(&self, limit: u32) -> zbus::fdo::Result<String> {
        tracing::info!(limit, "list_unknown requested");
        let limit = (limit > 0).then_some(limit as usize);
        let unknown: Vec<UnknownFace> = self
            .service
            .list_quarantined(limit)
            .map_err(unavailable)?
            .into_iter()
            .map(UnknownFace::from)
            .collect();
        to_json(&unknown)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let settings = self.service.settings();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "match_threshold": settings.match_threshold,
            "duplicate_threshold": settings.duplicate_threshold,
            "descriptor_dim": settings.descriptor_dim,
            "extract_timeout_ms": settings.extract_timeout.as_millis() as u64,
            "max_image_bytes": settings.image_limits.max_bytes,
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_core::{
        AttemptOutcome, EnrollmentSettings, IdentityStore, RegistrationOutcome,
        VerificationOutcome,
    };
    use image::{ImageBuffer, ImageFormat, Luma};
    use std::io::Cursor;

    fn photo() -> Vec<u8> {
        let img: ImageBuffer<Luma<u8>, Vec<u8>> = ImageBuffer::from_pixel(8, 8, Luma([128]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    /// Extractor process that reports the same face for every image.
    fn same_face_extractor() -> CommandExtractor {
        let face = vec!["0.0"; 128].join(", ");
        let script = format!(r#"cat > /dev/null; echo '{{"faces": [[{face}]]}}'"#);
        CommandExtractor::from_command(&["sh".into(), "-c".into(), script]).unwrap()
    }

    fn service() -> Arc<Service> {
        Arc::new(EnrollmentService::new(
            SqliteStore::in_memory().unwrap(),
            same_face_extractor(),
            HmacCredentialIssuer::new([3u8; 32], chrono::Duration::hours(1)),
            EnrollmentSettings::default(),
        ))
    }

    #[tokio::test]
    async fn test_registered_face_is_accepted() {
        let service = service();
        let user = match service
            .register("Ann", "ann@x.com", photo(), None)
            .await
            .unwrap()
        {
            RegistrationOutcome::Registered { identity, .. } => identity.identity_id,
            other => panic!("expected registration, got {other:?}"),
        };

        let accepted = match service.verify(photo()).await.unwrap() {
            VerificationOutcome::Accepted(accepted) => accepted,
            other => panic!("expected acceptance, got {other:?}"),
        };
        assert_eq!(accepted.identity_id, user);
        assert_eq!(
            HmacCredentialIssuer::new([3u8; 32], chrono::Duration::hours(1))
                .verify(&accepted.credential.token)
                .unwrap(),
            user
        );

        let stored = service.store().get(&user).unwrap().unwrap();
        assert_eq!(stored.attempt_log.len(), 2);
        assert_eq!(stored.attempt_log[1].outcome, AttemptOutcome::Matched);
        assert_eq!(stored.last_seen_at, stored.attempt_log[1].timestamp);
    }

    #[tokio::test]
    async fn test_promotion_merges_quarantine_history() {
        let service = service();
        let q = match service.verify(photo()).await.unwrap() {
            VerificationOutcome::Quarantined { quarantine_id } => quarantine_id,
            other => panic!("expected quarantine, got {other:?}"),
        };

        let (user, merged_from, attempt_count) = match service
            .register("Ann", "ann@x.com", photo(), Some(q))
            .await
            .unwrap()
        {
            RegistrationOutcome::Registered {
                identity,
                merged_from,
                attempt_count,
            } => (identity.identity_id, merged_from, attempt_count),
            other => panic!("expected registration, got {other:?}"),
        };
        assert_eq!(merged_from, Some(q));
        assert_eq!(attempt_count, 2);
        assert!(service.store().get(&q).unwrap().is_none());
        assert!(service.store().attempt_history(&q).unwrap().is_empty());

        assert!(matches!(
            service.verify(photo()).await.unwrap(),
            VerificationOutcome::Accepted(_)
        ));
        let log = service.store().get(&user).unwrap().unwrap().attempt_log;
        let outcomes: Vec<_> = log.iter().map(|r| r.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                AttemptOutcome::Quarantined,
                AttemptOutcome::Matched,
                AttemptOutcome::Matched
            ]
        );
    }

    #[tokio::test]
    async fn test_same_face_under_second_contact_is_duplicate() {
        let service = service();
        service
            .register("Ann", "ann@x.com", photo(), None)
            .await
            .unwrap();

        let outcome = service
            .register("Bea", "bea@x.com", photo(), None)
            .await
            .unwrap();
        assert_eq!(outcome.code(), "duplicate_face");
    }

    #[tokio::test]
    async fn test_interface_returns_json_outcomes() {
        let iface = FacegateService::new(service());

        let verified: serde_json::Value =
            serde_json::from_str(&iface.verify(photo()).await.unwrap()).unwrap();
        assert_eq!(verified["status"], "quarantined");

        let unknown: serde_json::Value =
            serde_json::from_str(&iface.list_unknown(0).await.unwrap()).unwrap();
        assert_eq!(unknown.as_array().unwrap().len(), 1);
        assert_eq!(unknown[0]["id"], verified["quarantine_id"]);
        assert_eq!(unknown[0]["attempts"], 1);

        let bad = iface.register("Ann", "ann@x.com", photo(), "not-a-uuid").await;
        assert!(matches!(bad, Err(zbus::fdo::Error::InvalidArgs(_))));
    }
}
