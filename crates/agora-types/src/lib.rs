use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identifier of a context.  Contexts are visible cluster-wide under this id.
pub type ContextId = Uuid;

/// Internal cluster-membership address of a kernel (the address the
/// distributed-map layer uses to tell members apart).
pub type MemberAddress = SocketAddr;

/// Boxed error used where a task or collaborator can fail with anything.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Specification tag of the default event space implementation.
pub const EVENT_SPACE_SPEC: &str = "agora.EventSpace";

// ─────────────────────────────────────────────────────────────────────────────
// Space and address identifiers
// ─────────────────────────────────────────────────────────────────────────────

/// Composite key of a space: owning context, space UUID and the
/// space-specification type tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpaceId {
    pub context_id: ContextId,
    pub id: Uuid,
    pub spec: String,
}

impl SpaceId {
    pub fn new(context_id: ContextId, id: Uuid, spec: impl Into<String>) -> Self {
        Self {
            context_id,
            id,
            spec: spec.into(),
        }
    }

    /// Shorthand for a space of the default [`EVENT_SPACE_SPEC`] type.
    pub fn event_space(context_id: ContextId, id: Uuid) -> Self {
        Self::new(context_id, id, EVENT_SPACE_SPEC)
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.context_id, self.id)
    }
}

/// Space-scoped identifier of a participant.
///
/// `id` names the address itself; for the common single-address case it is
/// equal to the participant id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub space: SpaceId,
    pub participant: Uuid,
    pub id: Uuid,
}

impl Address {
    /// The canonical address of `participant` in `space`.
    pub fn new(space: SpaceId, participant: Uuid) -> Self {
        Self {
            space,
            participant,
            id: participant,
        }
    }

    /// An additional address for `participant`, distinguished by `id`.
    pub fn with_id(space: SpaceId, participant: Uuid, id: Uuid) -> Self {
        Self {
            space,
            participant,
            id,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.space)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Kernel endpoint
// ─────────────────────────────────────────────────────────────────────────────

/// Public network endpoint of a kernel, `scheme://host:port`.
///
/// A `None` port stands for the `*` wildcard, which the transport resolves to
/// a concrete port when it binds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelUri {
    scheme: String,
    host: String,
    port: Option<u16>,
}

impl KernelUri {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn is_wildcard(&self) -> bool {
        self.port.is_none()
    }

    /// Copy of this endpoint bound to a concrete `port`.
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port: Some(port),
            ..self.clone()
        }
    }
}

impl fmt::Display for KernelUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}://{}:{}", self.scheme, self.host, port),
            None => write!(f, "{}://{}:*", self.scheme, self.host),
        }
    }
}

impl FromStr for KernelUri {
    type Err = AgoraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| AgoraError::InvalidUri {
            uri: s.to_string(),
            reason: reason.to_string(),
        };
        let (scheme, rest) = s.split_once("://").ok_or_else(|| invalid("missing scheme"))?;
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+') {
            return Err(invalid("bad scheme"));
        }
        let (host, port) = rest.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
        if host.is_empty() || host.contains('/') {
            return Err(invalid("bad host"));
        }
        let port = match port {
            "*" => None,
            p => Some(p.parse::<u16>().map_err(|_| invalid("bad port"))?),
        };
        Ok(Self::new(scheme, host, port))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Events
// ─────────────────────────────────────────────────────────────────────────────

/// An event routed through a space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// Address of the emitter inside the space the event is emitted in.
    pub source: Option<Address>,
    /// Stable type tag, e.g. `"agora.ContextJoined"`.
    pub kind: String,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: None,
            kind: kind.into(),
            payload,
        }
    }

    pub fn with_source(mut self, source: Address) -> Self {
        self.source = Some(source);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scopes
// ─────────────────────────────────────────────────────────────────────────────

/// Predicate over addresses selecting the delivery targets of an event.
///
/// Implementations must be side-effect free: the router evaluates `matches`
/// exactly once per candidate address.
pub trait Scope: fmt::Debug + Send + Sync {
    fn matches(&self, address: &Address) -> bool;
}

/// Matches every address.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllScope;

impl Scope for AllScope {
    fn matches(&self, _address: &Address) -> bool {
        true
    }
}

/// Matches an explicit set of addresses.
#[derive(Debug, Clone, Default)]
pub struct AddressScope(HashSet<Address>);

impl AddressScope {
    pub fn of(addresses: impl IntoIterator<Item = Address>) -> Self {
        Self(addresses.into_iter().collect())
    }
}

impl Scope for AddressScope {
    fn matches(&self, address: &Address) -> bool {
        self.0.contains(address)
    }
}

/// Matches every address held by one of the listed participants.
#[derive(Debug, Clone, Default)]
pub struct ParticipantScope(HashSet<Uuid>);

impl ParticipantScope {
    pub fn of(participants: impl IntoIterator<Item = Uuid>) -> Self {
        Self(participants.into_iter().collect())
    }
}

impl Scope for ParticipantScope {
    fn matches(&self, address: &Address) -> bool {
        self.0.contains(&address.participant)
    }
}

/// Scope backed by a closure.
pub struct FnScope<F>(pub F);

impl<F> fmt::Debug for FnScope<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnScope")
    }
}

impl<F> Scope for FnScope<F>
where
    F: Fn(&Address) -> bool + Send + Sync,
{
    fn matches(&self, address: &Address) -> bool {
        (self.0)(address)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Workspace-wide error type for kernel services.
#[derive(Error, Debug)]
pub enum AgoraError {
    #[error("Invalid kernel URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("Event origin {origin:?} does not belong to space {space}")]
    ForeignSource {
        space: SpaceId,
        origin: Option<Address>,
    },

    #[error("Unknown context: {0}")]
    UnknownContext(ContextId),

    #[error("Unknown space: {0}")]
    UnknownSpace(SpaceId),

    #[error("Context {0} has no default space yet")]
    DefaultSpaceMissing(ContextId),

    #[error("The default space {0} cannot be destroyed on its own")]
    DefaultSpaceProtected(SpaceId),

    #[error("Service '{service}' failed to start: {reason}")]
    ServiceStartFailed { service: String, reason: String },

    #[error("Service '{service}' failed to stop: {reason}")]
    ServiceStopFailed { service: String, reason: String },

    #[error("Service '{service}' did not become ready within {timeout_ms} ms")]
    StartupTimeout { service: String, timeout_ms: u64 },

    #[error("Spawn disabled: {0}")]
    SpawnDisabled(String),

    #[error("Participant {participant} is not registered in context {context}")]
    ParticipantNotFound { participant: Uuid, context: ContextId },

    #[error("Network Error: {0}")]
    Network(String),

    #[error("Configuration Error: {0}")]
    Config(String),
}

/// Failure outcome of a unit of work run by the executor.
///
/// `Cancelled` is the silent sentinel: deliberately cancelled work unwinds
/// with it and it is never reported as a fault, even when wrapped in
/// [`TaskError::Execution`].
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("task cancelled")]
    Cancelled,

    #[error("task interrupted: {0}")]
    Interrupted(String),

    #[error("task failed: {0}")]
    Failed(#[source] BoxError),

    #[error("execution failed: {0}")]
    Execution(#[source] Box<TaskError>),
}

impl TaskError {
    pub fn failed(error: impl Into<BoxError>) -> Self {
        TaskError::Failed(error.into())
    }

    /// Wrap `self` in an [`TaskError::Execution`] layer.
    pub fn wrap(self) -> Self {
        TaskError::Execution(Box::new(self))
    }

    /// `true` when this is the cancellation sentinel, at any wrapping depth.
    pub fn is_cancellation(&self) -> bool {
        match self {
            TaskError::Cancelled => true,
            TaskError::Execution(inner) => inner.is_cancellation(),
            _ => false,
        }
    }

    /// `true` for an ordinary interruption, at any wrapping depth.
    pub fn is_interruption(&self) -> bool {
        match self {
            TaskError::Interrupted(_) => true,
            TaskError::Execution(inner) => inner.is_interruption(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> SpaceId {
        SpaceId::event_space(Uuid::new_v4(), Uuid::new_v4())
    }

    #[test]
    fn kernel_uri_parses_concrete_port() {
        let uri: KernelUri = "tcp://10.0.0.1:5555".parse().unwrap();
        assert_eq!(uri.scheme(), "tcp");
        assert_eq!(uri.host(), "10.0.0.1");
        assert_eq!(uri.port(), Some(5555));
        assert_eq!(uri.to_string(), "tcp://10.0.0.1:5555");
    }

    #[test]
    fn kernel_uri_parses_wildcard_port() {
        let uri: KernelUri = "tcp://localhost:*".parse().unwrap();
        assert!(uri.is_wildcard());
        assert_eq!(uri.with_port(4000).to_string(), "tcp://localhost:4000");
        assert_eq!(uri.to_string(), "tcp://localhost:*");
    }

    #[test]
    fn kernel_uri_rejects_malformed_input() {
        for bad in ["localhost:80", "tcp://:80", "tcp://host", "tcp://host:port", "://h:1"] {
            let result = bad.parse::<KernelUri>();
            assert!(
                matches!(result, Err(AgoraError::InvalidUri { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn canonical_address_uses_participant_id() {
        let participant = Uuid::new_v4();
        let addr = Address::new(space(), participant);
        assert_eq!(addr.id, participant);
    }

    #[test]
    fn scopes_select_expected_addresses() {
        let s = space();
        let a1 = Address::new(s.clone(), Uuid::new_v4());
        let a2 = Address::new(s.clone(), Uuid::new_v4());

        assert!(AllScope.matches(&a1));

        let only_a1 = AddressScope::of([a1.clone()]);
        assert!(only_a1.matches(&a1));
        assert!(!only_a1.matches(&a2));

        let by_participant = ParticipantScope::of([a2.participant]);
        assert!(by_participant.matches(&a2));
        assert!(!by_participant.matches(&a1));

        let target = a1.id;
        let closure = FnScope(move |a: &Address| a.id == target);
        assert!(closure.matches(&a1));
        assert!(!closure.matches(&a2));
    }

    #[test]
    fn cancellation_sentinel_is_seen_through_wrapping() {
        assert!(TaskError::Cancelled.is_cancellation());
        assert!(TaskError::Cancelled.wrap().wrap().is_cancellation());
        assert!(!TaskError::Interrupted("stop".into()).is_cancellation());
        assert!(TaskError::Interrupted("stop".into()).wrap().is_interruption());
        assert!(!TaskError::failed("boom").is_cancellation());
    }

    #[test]
    fn event_roundtrip_keeps_source() {
        let source = Address::new(space(), Uuid::new_v4());
        let event = Event::new("agora.Ping", serde_json::json!({"n": 1})).with_source(source.clone());
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, event.id);
        assert_eq!(back.source, Some(source));
        assert_eq!(back.payload["n"], 1);
    }

    #[test]
    fn agora_error_display() {
        let err = AgoraError::ServiceStartFailed {
            service: "directory".into(),
            reason: "map offline".into(),
        };
        assert!(err.to_string().contains("directory"));
        assert!(err.to_string().contains("map offline"));
    }
}
