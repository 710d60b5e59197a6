//! Verification, registration and promotion of face identities.
//!
//! Per-request state machine for `verify`:
//!
//! ```text
//! RECEIVED --extract--> DESCRIPTOR_READY --match--> MATCHED | UNMATCHED
//! RECEIVED --extract fails--> REJECTED(reason)
//! MATCHED   --> issue credential, append MATCHED record, bump last_seen_at
//! UNMATCHED --> insert QUARANTINED identity with its first record
//! ```
//!
//! Once a descriptor is ready nothing else is awaited, so a request that
//! reaches MATCHED or UNMATCHED cannot be cancelled halfway through its writes.

use crate::credential::{Credential, CredentialError, CredentialIssuer};
use crate::extractor::{
    check_descriptor, DescriptorExtractor, ExtractError, FaceImage, ImageError, ImageLimits,
    DEFAULT_DESCRIPTOR_DIM,
};
use crate::matcher::{EuclideanMatcher, Matcher, DEFAULT_MATCH_THRESHOLD};
use crate::store::{IdentityStore, StoreError};
use crate::types::{
    AttemptOutcome, AttemptRecord, Descriptor, GalleryEntry, Identity, IdentityId, Role,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

const AUDIT_TARGET: &str = "facegate::audit";
const AVATAR_STYLE: &str = "background=7f0df2&color=fff";

pub const DEFAULT_EXTRACT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_UNKNOWN_LIST_LIMIT: usize = 50;

/// Tunables for [`EnrollmentService`].
#[derive(Debug, Clone)]
pub struct EnrollmentSettings {
    /// Maximum distance for a verification match.
    pub match_threshold: f32,
    /// Maximum distance at which a new registration counts as an existing face.
    pub duplicate_threshold: f32,
    pub descriptor_dim: usize,
    pub extract_timeout: Duration,
    pub image_limits: ImageLimits,
    /// Base URL for generated avatars; `None` leaves `avatar_ref` empty.
    pub avatar_base_url: Option<String>,
    pub unknown_list_limit: usize,
}

impl Default for EnrollmentSettings {
    fn default() -> Self {
        Self {
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            duplicate_threshold: DEFAULT_MATCH_THRESHOLD,
            descriptor_dim: DEFAULT_DESCRIPTOR_DIM,
            extract_timeout: DEFAULT_EXTRACT_TIMEOUT,
            image_limits: ImageLimits::default(),
            avatar_base_url: None,
            unknown_list_limit: DEFAULT_UNKNOWN_LIST_LIMIT,
        }
    }
}

/// Why an image or profile was not usable. Never retried by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    NoFace,
    MultiFace,
    EmptyImage,
    UnreadableImage,
    ImageTooLarge,
    ExtractorTimeout,
    InvalidProfile,
}

impl RejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::NoFace => "no_face",
            RejectReason::MultiFace => "multi_face",
            RejectReason::EmptyImage => "empty_image",
            RejectReason::UnreadableImage => "unreadable_image",
            RejectReason::ImageTooLarge => "image_too_large",
            RejectReason::ExtractorTimeout => "extractor_timeout",
            RejectReason::InvalidProfile => "invalid_profile",
        }
    }
}

impl From<ImageError> for RejectReason {
    fn from(err: ImageError) -> Self {
        match err {
            ImageError::Empty => RejectReason::EmptyImage,
            ImageError::Unreadable(_) => RejectReason::UnreadableImage,
            ImageError::TooLarge(_) => RejectReason::ImageTooLarge,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DuplicateReason {
    Contact,
    Face { identity_id: IdentityId },
}

impl DuplicateReason {
    pub fn code(&self) -> &'static str {
        match self {
            DuplicateReason::Contact => "duplicate_contact",
            DuplicateReason::Face { .. } => "duplicate_face",
        }
    }
}

/// A resolved identity as handed to the outer surface.
#[derive(Debug, Clone, Serialize)]
pub struct AcceptedIdentity {
    pub identity_id: IdentityId,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub credential: Credential,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerificationOutcome {
    Accepted(AcceptedIdentity),
    Quarantined { quarantine_id: IdentityId },
    Rejected { reason: RejectReason },
}

impl VerificationOutcome {
    pub fn code(&self) -> &'static str {
        match self {
            VerificationOutcome::Accepted(_) => "accepted",
            VerificationOutcome::Quarantined { .. } => "quarantined",
            VerificationOutcome::Rejected { reason } => reason.code(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RegistrationOutcome {
    Registered {
        identity: AcceptedIdentity,
        /// Quarantine whose history was merged in, if it still existed.
        merged_from: Option<IdentityId>,
        attempt_count: usize,
    },
    Rejected { reason: RejectReason },
    Duplicate { reason: DuplicateReason },
}

impl RegistrationOutcome {
    pub fn code(&self) -> &'static str {
        match self {
            RegistrationOutcome::Registered { .. } => "registered",
            RegistrationOutcome::Rejected { reason } => reason.code(),
            RegistrationOutcome::Duplicate { reason } => reason.code(),
        }
    }
}

/// A collaborator (extractor, store, credential issuer) could not serve the
/// request. Distinct from rejections so callers can retry with backoff.
#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("descriptor extractor unavailable: {0}")]
    Extractor(String),
    #[error("identity store unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("credential issuer unavailable: {0}")]
    Credential(#[from] CredentialError),
}

impl EnrollmentError {
    pub fn code(&self) -> &'static str {
        "service_unavailable"
    }
}

/// Registration profile after normalization.
#[derive(Debug, Clone, PartialEq)]
struct Profile {
    display_name: String,
    contact: String,
}

impl Profile {
    fn normalize(display_name: &str, contact: &str) -> Option<Self> {
        let display_name = display_name.trim();
        let contact = contact.trim().to_lowercase();
        if display_name.is_empty() || contact.is_empty() || !contact.contains('@') {
            return None;
        }
        Some(Self {
            display_name: display_name.to_string(),
            contact,
        })
    }
}

/// Orchestrates verify / register / promote over injected collaborators.
pub struct EnrollmentService<S, E, C> {
    store: S,
    extractor: E,
    issuer: C,
    matcher: Box<dyn Matcher>,
    settings: EnrollmentSettings,
}

impl<S, E, C> EnrollmentService<S, E, C>
where
    S: IdentityStore,
    E: DescriptorExtractor,
    C: CredentialIssuer,
{
    pub fn new(store: S, extractor: E, issuer: C, settings: EnrollmentSettings) -> Self {
        Self {
            store,
            extractor,
            issuer,
            matcher: Box::new(EuclideanMatcher),
            settings,
        }
    }

    /// Swap the matching strategy (e.g. for an indexed matcher).
    pub fn with_matcher(mut self, matcher: Box<dyn Matcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn settings(&self) -> &EnrollmentSettings {
        &self.settings
    }

    /// Resolve an image to an existing user, a new quarantine record, or a rejection.
    pub async fn verify(&self, image: Vec<u8>) -> Result<VerificationOutcome, EnrollmentError> {
        let descriptor = match self.descriptor_for(image).await? {
            Ok(descriptor) => descriptor,
            Err(reason) => {
                audit_reject("verify", reason);
                return Ok(VerificationOutcome::Rejected { reason });
            }
        };

        let gallery = self.store.gallery()?;
        let result = self
            .matcher
            .compare(&descriptor, &gallery, self.settings.match_threshold);
        tracing::debug!(
            gallery = gallery.len(),
            matched = result.matched,
            distance = ?result.distance,
            "verify: match computed"
        );

        match result.identity_id.filter(|_| result.matched) {
            Some(id) => {
                let credential = self.issuer.issue(&id)?;
                let record = AttemptRecord::now(AttemptOutcome::Matched, &descriptor);
                let identity = self.store.record_attempt(&id, record, true)?;
                tracing::info!(
                    target: AUDIT_TARGET,
                    operation = "verify",
                    outcome = "accepted",
                    identity = %id,
                    distance = ?result.distance,
                    "face matched"
                );
                Ok(VerificationOutcome::Accepted(AcceptedIdentity {
                    identity_id: id,
                    display_name: identity.display_name,
                    avatar_ref: identity.avatar_ref,
                    credential,
                }))
            }
            None => {
                let quarantine = Identity::quarantined(descriptor);
                self.store.insert(&quarantine)?;
                tracing::info!(
                    target: AUDIT_TARGET,
                    operation = "verify",
                    outcome = "quarantined",
                    identity = %quarantine.id,
                    distance = ?result.distance,
                    "unrecognized face quarantined"
                );
                Ok(VerificationOutcome::Quarantined {
                    quarantine_id: quarantine.id,
                })
            }
        }
    }

    /// Register a new user, promoting `quarantine_id` when it still exists.
    pub async fn register(
        &self,
        display_name: &str,
        contact: &str,
        image: Vec<u8>,
        quarantine_id: Option<IdentityId>,
    ) -> Result<RegistrationOutcome, EnrollmentError> {
        let Some(profile) = Profile::normalize(display_name, contact) else {
            audit_reject("register", RejectReason::InvalidProfile);
            return Ok(RegistrationOutcome::Rejected {
                reason: RejectReason::InvalidProfile,
            });
        };

        let descriptor = match self.descriptor_for(image).await? {
            Ok(descriptor) => descriptor,
            Err(reason) => {
                audit_reject("register", reason);
                return Ok(RegistrationOutcome::Rejected { reason });
            }
        };

        if self.store.find_by_contact(&profile.contact)?.is_some() {
            return Ok(duplicate(DuplicateReason::Contact));
        }

        if let Some(identity_id) = self.registered_face(&descriptor, &self.store.gallery()?) {
            return Ok(duplicate(DuplicateReason::Face { identity_id }));
        }

        let avatar_ref = self.avatar_for(&profile.display_name);
        let registered = Identity::registered(
            profile.display_name,
            profile.contact,
            avatar_ref,
            descriptor.clone(),
        );
        let credential = self.issuer.issue(&registered.id)?;

        // Contact and face are checked again inside the write.
        let face_guard = |gallery: &[GalleryEntry]| self.registered_face(&descriptor, gallery);
        let promotion = match self
            .store
            .promote(registered, quarantine_id.as_ref(), &face_guard)
        {
            Ok(promotion) => promotion,
            Err(StoreError::DuplicateContact(_)) => {
                return Ok(duplicate(DuplicateReason::Contact));
            }
            Err(StoreError::DuplicateFace(identity_id)) => {
                return Ok(duplicate(DuplicateReason::Face { identity_id }));
            }
            Err(err) => return Err(err.into()),
        };

        if quarantine_id.is_some() && promotion.merged_from.is_none() {
            tracing::info!(
                quarantine = ?quarantine_id.map(|q| q.to_string()),
                "quarantine already gone; registered as fresh identity"
            );
        }
        let identity = promotion.identity;
        tracing::info!(
            target: AUDIT_TARGET,
            operation = "register",
            outcome = "registered",
            identity = %identity.id,
            merged_from = ?promotion.merged_from.map(|q| q.to_string()),
            attempts = identity.attempt_log.len(),
            "identity registered"
        );

        Ok(RegistrationOutcome::Registered {
            attempt_count: identity.attempt_log.len(),
            merged_from: promotion.merged_from,
            identity: AcceptedIdentity {
                identity_id: identity.id,
                display_name: identity.display_name,
                avatar_ref: identity.avatar_ref,
                credential,
            },
        })
    }

    /// Quarantined identities, newest first. Read-only.
    pub fn list_quarantined(&self, limit: Option<usize>) -> Result<Vec<Identity>, EnrollmentError> {
        let limit = limit.unwrap_or(self.settings.unknown_list_limit);
        let mut quarantined = self.store.find_by_role(Role::Quarantined)?;
        // Newest insertion first among equal timestamps.
        quarantined.reverse();
        quarantined.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        quarantined.truncate(limit);
        Ok(quarantined)
    }

    /// Registered identity whose face is within the duplicate threshold of `descriptor`.
    fn registered_face(
        &self,
        descriptor: &Descriptor,
        gallery: &[GalleryEntry],
    ) -> Option<IdentityId> {
        let existing = self
            .matcher
            .compare(descriptor, gallery, self.settings.duplicate_threshold);
        existing.identity_id.filter(|_| existing.matched)
    }

    /// Validate the image and run the extractor under the configured timeout.
    async fn descriptor_for(
        &self,
        image: Vec<u8>,
    ) -> Result<Result<Descriptor, RejectReason>, EnrollmentError> {
        let image = match FaceImage::decode(image, &self.settings.image_limits) {
            Ok(image) => image,
            Err(err) => {
                tracing::debug!(error = %err, "image rejected before extraction");
                return Ok(Err(err.into()));
            }
        };

        let extracted =
            match tokio::time::timeout(self.settings.extract_timeout, self.extractor.extract(&image))
                .await
            {
                Ok(extracted) => extracted,
                Err(_) => Err(ExtractError::Timeout),
            };

        let descriptor = match extracted {
            Ok(descriptor) => descriptor,
            Err(ExtractError::NoFaceDetected) => return Ok(Err(RejectReason::NoFace)),
            Err(ExtractError::MultipleFacesDetected) => return Ok(Err(RejectReason::MultiFace)),
            Err(ExtractError::Timeout) => {
                tracing::warn!(
                    timeout_ms = self.settings.extract_timeout.as_millis() as u64,
                    "descriptor extraction timed out"
                );
                return Ok(Err(RejectReason::ExtractorTimeout));
            }
            Err(err) => return Err(EnrollmentError::Extractor(err.to_string())),
        };

        check_descriptor(&descriptor, self.settings.descriptor_dim)
            .map_err(|err| EnrollmentError::Extractor(err.to_string()))?;
        Ok(Ok(descriptor))
    }

    fn avatar_for(&self, display_name: &str) -> Option<String> {
        self.settings
            .avatar_base_url
            .as_ref()
            .map(|base| format!("{base}?name={}&{AVATAR_STYLE}", encode_query(display_name)))
    }
}

fn audit_reject(operation: &'static str, reason: RejectReason) {
    tracing::info!(
        target: AUDIT_TARGET,
        operation,
        outcome = "rejected",
        reason = reason.code(),
        "attempt rejected"
    );
}

fn duplicate(reason: DuplicateReason) -> RegistrationOutcome {
    tracing::info!(
        target: AUDIT_TARGET,
        operation = "register",
        outcome = "duplicate",
        reason = reason.code(),
        "registration conflicts with existing identity"
    );
    RegistrationOutcome::Duplicate { reason }
}

/// Percent-encode a query value (RFC 3986 unreserved characters pass through).
fn encode_query(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_normalization() {
        let profile = Profile::normalize("  Ann Lee ", " Ann@X.com ").unwrap();
        assert_eq!(profile.display_name, "Ann Lee");
        assert_eq!(profile.contact, "ann@x.com");
    }

    #[test]
    fn test_profile_rejects_blank_or_handle_without_at() {
        assert!(Profile::normalize("", "ann@x.com").is_none());
        assert!(Profile::normalize("Ann", "   ").is_none());
        assert!(Profile::normalize("Ann", "ann.x.com").is_none());
    }

    #[test]
    fn test_encode_query() {
        assert_eq!(encode_query("Ann Lee"), "Ann%20Lee");
        assert_eq!(encode_query("Zoë"), "Zo%C3%AB");
        assert_eq!(encode_query("a-b_c.d~"), "a-b_c.d~");
    }

    #[test]
    fn test_reason_codes_are_distinct() {
        let codes = [
            RejectReason::NoFace.code(),
            RejectReason::MultiFace.code(),
            RejectReason::EmptyImage.code(),
            RejectReason::UnreadableImage.code(),
            RejectReason::ImageTooLarge.code(),
            RejectReason::ExtractorTimeout.code(),
            RejectReason::InvalidProfile.code(),
            DuplicateReason::Contact.code(),
            DuplicateReason::Face {
                identity_id: IdentityId::generate(),
            }
            .code(),
        ];
        let unique: std::collections::HashSet<_> = codes.iter().collect();
        assert_eq!(unique.len(), codes.len());
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let outcome = VerificationOutcome::Rejected {
            reason: RejectReason::MultiFace,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "rejected");
        assert_eq!(json["reason"], "multi_face");
    }
}
