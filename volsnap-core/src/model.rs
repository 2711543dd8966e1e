/*!
Records exchanged with the object store and kept in the state caches.

A [`SnapshotRequest`] is what a user declares; a [`SnapshotData`] is the
engine-managed record of a snapshot that exists on a backend. Both carry an
append-only list of [`Condition`]s whose last entry is authoritative.
*/

use crate::{Result, SnapshotError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Label naming the engine instance that owns a record
pub const CONTROLLER_LABEL: &str = "snapshot.volsnap.io/controller";
/// Label stamped on a request before the backend call (nanoseconds since epoch)
pub const SNAPSHOT_TIMESTAMP_LABEL: &str = "SnapshotMetadata-Timestamp";
/// Label stamped on a request with the name of the snapshotted volume
pub const SNAPSHOT_VOLUME_LABEL: &str = "SnapshotMetadata-PVName";

/// Backend tag carrying the request namespace
pub const TAG_NAMESPACE: &str = "kubernetes.io/created-for/snapshot/namespace";
/// Backend tag carrying the request name
pub const TAG_NAME: &str = "kubernetes.io/created-for/snapshot/name";
/// Backend tag carrying the request uid
pub const TAG_UID: &str = "kubernetes.io/created-for/snapshot/uid";
/// Backend tag carrying the time the create was issued
pub const TAG_TIMESTAMP: &str = "kubernetes.io/created-for/snapshot/timestamp";

/// Prefix for generated SnapshotData names
pub const SNAPSHOT_DATA_NAME_PREFIX: &str = "k8s-volume-snapshot";

/// Tag set attached to a backend snapshot for later identification
pub type SnapshotTags = BTreeMap<String, String>;

/// `namespace/name` identity of a snapshot request
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SnapshotKey {
    namespace: String,
    name: String,
}

impl SnapshotKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        let name = name.into();
        if namespace.is_empty() || name.is_empty() {
            return Err(SnapshotError::malformed(format!(
                "snapshot key needs a namespace and a name, got '{namespace}/{name}'"
            )));
        }
        if namespace.contains('/') || name.contains('/') {
            return Err(SnapshotError::malformed(format!(
                "snapshot key parts must not contain '/', got '{namespace}/{name}'"
            )));
        }
        Ok(Self { namespace, name })
    }

    /// Parse a `namespace/name` string
    pub fn parse(key: &str) -> Result<Self> {
        match key.split_once('/') {
            Some((namespace, name)) => Self::new(namespace, name),
            None => Err(SnapshotError::malformed(format!(
                "invalid snapshot name '{key}', expected namespace/name"
            ))),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for SnapshotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for SnapshotKey {
    type Err = SnapshotError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SnapshotKey {
    type Error = SnapshotError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<SnapshotKey> for String {
    fn from(key: SnapshotKey) -> Self {
        key.to_string()
    }
}

/// Metadata common to every stored record
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,

    /// Empty for cluster-scoped records
    #[serde(default)]
    pub namespace: String,

    /// Assigned by the object store on create
    #[serde(default)]
    pub uid: String,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Bumped by the object store on every write
    #[serde(default)]
    pub resource_version: u64,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// Identity of the engine instance this record belongs to, if tagged
    pub fn controller(&self) -> Option<&str> {
        self.labels.get(CONTROLLER_LABEL).map(String::as_str)
    }
}

/// Kind of snapshot condition
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionType {
    Pending,
    Ready,
    Error,
}

/// Status of a condition
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Observation of a snapshot's state at a point in time
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,
    pub status: ConditionStatus,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl Condition {
    pub fn new(
        condition_type: ConditionType,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            condition_type,
            status,
            last_transition_time: Utc::now(),
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn ready(message: impl Into<String>) -> Self {
        Self::new(ConditionType::Ready, ConditionStatus::True, "", message)
    }

    pub fn pending(message: impl Into<String>) -> Self {
        Self::new(ConditionType::Pending, ConditionStatus::True, "", message)
    }

    pub fn error(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ConditionType::Error, ConditionStatus::True, reason, message)
    }

    /// Same observation, ignoring when it was made
    pub fn same_observation(&self, other: &Condition) -> bool {
        self.condition_type == other.condition_type
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Coarse snapshot state derived from the last condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimplifiedStatus {
    New,
    Pending,
    Ready,
    Error,
}

impl fmt::Display for SimplifiedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Derive the simplified status of a condition list
///
/// An empty list is `New`: a record without conditions is never Ready.
pub fn simplified_status(conditions: &[Condition]) -> SimplifiedStatus {
    let Some(last) = conditions.last() else {
        return SimplifiedStatus::New;
    };
    match (last.condition_type, last.status) {
        (ConditionType::Ready, ConditionStatus::True) => SimplifiedStatus::Ready,
        (ConditionType::Error, _) => SimplifiedStatus::Error,
        (ConditionType::Pending, ConditionStatus::True | ConditionStatus::Unknown) => {
            SimplifiedStatus::Pending
        }
        _ => SimplifiedStatus::New,
    }
}

/// Append `condition` unless it repeats the last observation
///
/// Returns true when the list changed. Existing entries are never rewritten.
pub fn append_condition(conditions: &mut Vec<Condition>, condition: Condition) -> bool {
    if let Some(last) = conditions.last() {
        if last.same_observation(&condition) {
            return false;
        }
    }
    conditions.push(condition);
    true
}

/// Storage technology behind a volume or snapshot
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendKind {
    #[serde(rename = "hostPath")]
    HostPath,
    #[serde(rename = "aws_ebs")]
    AwsEbs,
    #[serde(rename = "gce-pd")]
    GcePd,
    #[serde(rename = "cinder")]
    Cinder,
    #[serde(rename = "glusterfs")]
    Gluster,
    #[serde(rename = "memory")]
    Memory,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HostPath => "hostPath",
            Self::AwsEbs => "aws_ebs",
            Self::GcePd => "gce-pd",
            Self::Cinder => "cinder",
            Self::Gluster => "glusterfs",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a volume's data lives; selects the plugin used to snapshot it
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum VolumeSource {
    HostPath { path: String },
    AwsElasticBlockStore { volume_id: String },
    GcePersistentDisk { pd_name: String },
    Cinder { volume_id: String },
    Glusterfs { volume: String },
    Memory { volume_id: String },
}

impl VolumeSource {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::HostPath { .. } => BackendKind::HostPath,
            Self::AwsElasticBlockStore { .. } => BackendKind::AwsEbs,
            Self::GcePersistentDisk { .. } => BackendKind::GcePd,
            Self::Cinder { .. } => BackendKind::Cinder,
            Self::Glusterfs { .. } => BackendKind::Gluster,
            Self::Memory { .. } => BackendKind::Memory,
        }
    }
}

/// Backend-specific location of a snapshot; exactly one variant is populated
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SnapshotSource {
    /// Archive of a host directory
    HostPath { path: String },
    AwsElasticBlockStore { snapshot_id: String },
    GcePersistentDisk { snapshot_name: String },
    Cinder { snapshot_id: String },
    Glusterfs { snapshot_name: String },
    Memory { snapshot_id: String },
}

impl SnapshotSource {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::HostPath { .. } => BackendKind::HostPath,
            Self::AwsElasticBlockStore { .. } => BackendKind::AwsEbs,
            Self::GcePersistentDisk { .. } => BackendKind::GcePd,
            Self::Cinder { .. } => BackendKind::Cinder,
            Self::Glusterfs { .. } => BackendKind::Gluster,
            Self::Memory { .. } => BackendKind::Memory,
        }
    }

    /// Backend identifier of the snapshot, whatever its kind
    pub fn id(&self) -> &str {
        match self {
            Self::HostPath { path } => path,
            Self::AwsElasticBlockStore { snapshot_id }
            | Self::Cinder { snapshot_id }
            | Self::Memory { snapshot_id } => snapshot_id,
            Self::GcePersistentDisk { snapshot_name } | Self::Glusterfs { snapshot_name } => {
                snapshot_name
            }
        }
    }
}

/// Desired state of a snapshot request
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRequestSpec {
    /// Name of the volume claim being snapshotted (same namespace)
    #[serde(default)]
    pub persistent_volume_claim_name: String,

    /// Binds the request to its SnapshotData once created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_data_name: Option<String>,
}

/// Observed state of a snapshot request, mirrored from its SnapshotData
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRequestStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// User-declared request for a snapshot of a volume claim
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: SnapshotRequestSpec,
    #[serde(default)]
    pub status: SnapshotRequestStatus,
}

impl SnapshotRequest {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        claim_name: impl Into<String>,
    ) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(namespace, name),
            spec: SnapshotRequestSpec {
                persistent_volume_claim_name: claim_name.into(),
                snapshot_data_name: None,
            },
            status: SnapshotRequestStatus::default(),
        }
    }

    /// Restrict this request to the engine instance with the given identity
    pub fn with_controller(mut self, controller: impl Into<String>) -> Self {
        self.metadata
            .labels
            .insert(CONTROLLER_LABEL.to_string(), controller.into());
        self
    }

    pub fn key(&self) -> Result<SnapshotKey> {
        SnapshotKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    pub fn claim_name(&self) -> Option<&str> {
        let claim = self.spec.persistent_volume_claim_name.as_str();
        (!claim.is_empty()).then_some(claim)
    }

    pub fn snapshot_data_name(&self) -> Option<&str> {
        self.spec
            .snapshot_data_name
            .as_deref()
            .filter(|name| !name.is_empty())
    }

    pub fn status(&self) -> SimplifiedStatus {
        simplified_status(&self.status.conditions)
    }

    /// Tags identifying the backend snapshot made for this request
    ///
    /// Only available once the request has been stamped with a timestamp
    /// label by an earlier create attempt.
    pub fn backend_tags(&self) -> Option<SnapshotTags> {
        let timestamp = self.metadata.labels.get(SNAPSHOT_TIMESTAMP_LABEL)?;
        if self.metadata.uid.is_empty() {
            return None;
        }
        let mut tags = SnapshotTags::new();
        tags.insert(TAG_NAMESPACE.to_string(), self.metadata.namespace.clone());
        tags.insert(TAG_NAME.to_string(), self.metadata.name.clone());
        tags.insert(TAG_UID.to_string(), self.metadata.uid.clone());
        tags.insert(TAG_TIMESTAMP.to_string(), timestamp.clone());
        Some(tags)
    }
}

/// Spec of a SnapshotData record
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDataSpec {
    pub source: SnapshotSource,

    /// `namespace/name` of the originating request
    pub volume_snapshot_ref: SnapshotKey,

    /// Name of the volume the snapshot was taken from
    pub persistent_volume_ref: String,
}

/// Observed state of a SnapshotData record
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDataStatus {
    /// Time the first Ready condition was recorded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Engine-managed record of a snapshot that exists on a backend
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SnapshotData {
    pub metadata: ObjectMeta,
    pub spec: SnapshotDataSpec,
    #[serde(default)]
    pub status: SnapshotDataStatus,
}

impl SnapshotData {
    /// Build a new record with a generated cluster-wide unique name
    pub fn new(
        snapshot_ref: SnapshotKey,
        volume_name: impl Into<String>,
        source: SnapshotSource,
        owner: impl Into<String>,
    ) -> Self {
        let mut metadata = ObjectMeta::named(format!(
            "{}-{}",
            SNAPSHOT_DATA_NAME_PREFIX,
            uuid::Uuid::new_v4()
        ));
        metadata
            .labels
            .insert(CONTROLLER_LABEL.to_string(), owner.into());
        Self {
            metadata,
            spec: SnapshotDataSpec {
                source,
                volume_snapshot_ref: snapshot_ref,
                persistent_volume_ref: volume_name.into(),
            },
            status: SnapshotDataStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn owner(&self) -> Option<&str> {
        self.metadata.controller()
    }

    pub fn status(&self) -> SimplifiedStatus {
        simplified_status(&self.status.conditions)
    }

    /// Append a condition, stamping the creation time on the first Ready
    pub fn record_condition(&mut self, condition: Condition) -> bool {
        if condition.condition_type == ConditionType::Ready
            && condition.status == ConditionStatus::True
            && self.status.creation_timestamp.is_none()
        {
            self.status.creation_timestamp = Some(condition.last_transition_time);
        }
        append_condition(&mut self.status.conditions, condition)
    }
}

/// Entry of the actual-state cache: a request and the data proving it exists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActualSnapshot {
    pub request: SnapshotRequest,
    pub data: SnapshotData,
}

impl ActualSnapshot {
    pub fn key(&self) -> &SnapshotKey {
        &self.data.spec.volume_snapshot_ref
    }
}

/// Claim on a volume, bound once the volume is provisioned
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaim {
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_name: Option<String>,
}

impl VolumeClaim {
    pub fn bound(
        namespace: impl Into<String>,
        name: impl Into<String>,
        volume: impl Into<String>,
    ) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(namespace, name),
            volume_name: Some(volume.into()),
        }
    }

    pub fn unbound(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(namespace, name),
            volume_name: None,
        }
    }
}

/// Provisioned volume (cluster-scoped)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub metadata: ObjectMeta,
    pub source: VolumeSource,
}

impl Volume {
    pub fn new(name: impl Into<String>, source: VolumeSource) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            source,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}
