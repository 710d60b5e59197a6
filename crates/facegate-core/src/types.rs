use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Face descriptor (128-dimensional for the default extractor model).
///
/// Immutable once produced. The only operation defined between two
/// descriptors is [`euclidean_distance`](Self::euclidean_distance).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Descriptor {
    values: Vec<f32>,
}

impl Descriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two descriptors.
    ///
    /// Descriptors of different dimension are never comparable and are
    /// reported as infinitely far apart.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// Opaque identity identifier. Assigned at creation, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(Uuid);

impl IdentityId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for IdentityId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Registered,
    Quarantined,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Registered => "registered",
            Role::Quarantined => "quarantined",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "registered" => Ok(Role::Registered),
            "quarantined" => Ok(Role::Quarantined),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Matched,
    Quarantined,
    Rejected,
}

/// One authentication encounter. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub timestamp: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub descriptor_snapshot: Descriptor,
}

impl AttemptRecord {
    pub fn now(outcome: AttemptOutcome, descriptor: &Descriptor) -> Self {
        Self {
            timestamp: Utc::now(),
            outcome,
            descriptor_snapshot: descriptor.clone(),
        }
    }
}

/// A registered person or a yet-unclassified face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub role: Role,
    pub display_name: String,
    /// Email-like handle. Unique across registered identities only.
    pub contact: String,
    pub avatar_ref: Option<String>,
    /// Enrollment descriptor for registered identities; first sighting for quarantined ones.
    pub descriptor: Descriptor,
    /// Chronological, append-only.
    pub attempt_log: Vec<AttemptRecord>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

impl Identity {
    /// New registered identity seeded with one matched attempt record.
    pub fn registered(
        display_name: String,
        contact: String,
        avatar_ref: Option<String>,
        descriptor: Descriptor,
    ) -> Self {
        let record = AttemptRecord::now(AttemptOutcome::Matched, &descriptor);
        Self {
            id: IdentityId::generate(),
            role: Role::Registered,
            display_name,
            contact,
            avatar_ref,
            created_at: record.timestamp,
            last_seen_at: record.timestamp,
            descriptor,
            attempt_log: vec![record],
        }
    }

    /// New quarantined identity for an unrecognized sighting, with placeholder profile.
    pub fn quarantined(descriptor: Descriptor) -> Self {
        let id = IdentityId::generate();
        let record = AttemptRecord::now(AttemptOutcome::Quarantined, &descriptor);
        let short = id.to_string()[..8].to_string();
        Self {
            id,
            role: Role::Quarantined,
            display_name: format!("Unknown {short}"),
            contact: format!("unknown-{id}@quarantine.invalid"),
            avatar_ref: None,
            created_at: record.timestamp,
            last_seen_at: record.timestamp,
            descriptor,
            attempt_log: vec![record],
        }
    }

    pub fn is_registered(&self) -> bool {
        self.role == Role::Registered
    }
}

/// Registered identity as seen by the matcher: id and enrollment descriptor only.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub id: IdentityId,
    pub descriptor: Descriptor,
}

impl From<&Identity> for GalleryEntry {
    fn from(identity: &Identity) -> Self {
        Self {
            id: identity.id,
            descriptor: identity.descriptor.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Descriptor::new(vec![0.1, 0.2, 0.3]);
        assert_eq!(a.euclidean_distance(&a.clone()), 0.0);
    }

    #[test]
    fn test_euclidean_distance_known_value() {
        let a = Descriptor::new(vec![0.0, 0.0]);
        let b = Descriptor::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_dimension_mismatch() {
        let a = Descriptor::new(vec![0.0, 0.0]);
        let b = Descriptor::new(vec![0.0, 0.0, 0.0]);
        assert!(a.euclidean_distance(&b).is_infinite());
    }

    #[test]
    fn test_quarantined_identity_has_placeholders() {
        let q = Identity::quarantined(Descriptor::new(vec![1.0]));
        assert_eq!(q.role, Role::Quarantined);
        assert!(q.display_name.starts_with("Unknown "));
        assert!(q.contact.contains(&q.id.to_string()));
        assert_eq!(q.attempt_log.len(), 1);
        assert_eq!(q.attempt_log[0].outcome, AttemptOutcome::Quarantined);
    }

    #[test]
    fn test_registered_identity_seeded_with_match_record() {
        let r = Identity::registered(
            "Ann".into(),
            "ann@x.com".into(),
            None,
            Descriptor::new(vec![1.0, 2.0]),
        );
        assert!(r.is_registered());
        assert_eq!(r.attempt_log.len(), 1);
        assert_eq!(r.attempt_log[0].outcome, AttemptOutcome::Matched);
        assert_eq!(r.created_at, r.last_seen_at);
    }

    #[test]
    fn test_role_round_trips_through_str() {
        for role in [Role::Registered, Role::Quarantined] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
    }

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(IdentityId::generate(), IdentityId::generate());
    }
}
