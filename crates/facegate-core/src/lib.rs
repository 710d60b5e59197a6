//! facegate-core: face identity resolution engine.
//!
//! Matches face descriptors against registered identities, quarantines
//! unrecognized faces, and promotes quarantined faces into registered users.

pub mod credential;
pub mod enrollment;
pub mod extractor;
pub mod matcher;
pub mod store;
pub mod types;

pub use credential::{Credential, CredentialIssuer, HmacCredentialIssuer};
pub use enrollment::{
    AcceptedIdentity, DuplicateReason, EnrollmentError, EnrollmentService, EnrollmentSettings,
    RegistrationOutcome, RejectReason, VerificationOutcome,
};
pub use extractor::{DescriptorExtractor, ExtractError, FaceImage, ImageLimits};
pub use matcher::{EuclideanMatcher, MatchResult, Matcher};
pub use store::{IdentityStore, MemoryStore, Promotion, StoreError};
pub use types::{
    AttemptOutcome, AttemptRecord, Descriptor, GalleryEntry, Identity, IdentityId, Role,
};
