use thiserror::Error;

use crate::engine::{NodeId, PadRef};

/**
    Errors reported by a pipeline engine backend.
*/
#[derive(Debug, Error)]
pub enum EngineError {
    /// No factory with that type name, or the backend refused to build it.
    #[error("cannot create node '{name}' from factory '{factory}': {reason}")]
    Create {
        factory: String,
        name: String,
        reason: String,
    },
    /// Unknown property or a value the node rejects.
    #[error("cannot set property '{key}' on {node}: {reason}")]
    Property {
        node: NodeId,
        key: String,
        reason: String,
    },
    /// The node does not exist (never created, or already removed).
    #[error("unknown node {0}")]
    NoSuchNode(NodeId),
    /// The node exists but has no pad with that name.
    #[error("node {node} has no pad '{pad}'")]
    NoSuchPad { node: NodeId, pad: String },
    /// A structural link between two pads failed.
    #[error("cannot link {src} -> {sink}: {reason}")]
    Link {
        src: PadRef,
        sink: PadRef,
        reason: LinkFailure,
    },
    /// Two pads that were expected to be peers are not.
    #[error("{src} and {sink} are not linked")]
    NotLinked { src: PadRef, sink: PadRef },
    /// Adding or removing a node from the graph failed.
    #[error("graph change failed for {node}: {reason}")]
    Graph { node: NodeId, reason: String },
    /// A serialized event hit a pad whose streaming thread is parked in a block.
    #[error("{0} is blocked with data queued")]
    Blocked(PadRef),
    /// A run-state change was refused.
    #[error("state change to {state} failed: {reason}")]
    StateChange { state: String, reason: String },
    /// The backend itself could not be initialised.
    #[error("engine unavailable: {0}")]
    Unavailable(String),
}

/**
    Why a pad link was refused.
*/
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkFailure {
    #[error("incompatible caps ({src_caps} vs {sink_caps})")]
    Incompatible { src_caps: String, sink_caps: String },
    #[error("pad already linked")]
    AlreadyLinked,
    #[error("wrong pad direction")]
    WrongDirection,
    #[error("nodes are not in the same graph")]
    NotInGraph,
    #[error("{0}")]
    Other(String),
}

/**
    Failures of a single swap attempt.

    None of these stop the process; the coordinator logs them and parks in
    the failed phase.
*/
#[derive(Debug, Error)]
pub enum SwapError {
    /// The old source could not be unlinked or removed.
    #[error("detaching old source failed: {0}")]
    Detach(#[source] EngineError),
    /// The replacement source could not be created or configured.
    #[error("creating source for '{uri}' failed: {source}")]
    SourceCreate {
        uri: String,
        #[source]
        source: EngineError,
    },
    /// A source announced output that could not be linked.
    #[error("linking source output failed: {0}")]
    Link(#[from] AttachError),
    /// The replacement source never produced output, even after retries.
    #[error("new source never produced output after {attempts} attempt(s)")]
    RelinkExhausted { attempts: u32 },
    /// The block or drain probes could not be installed.
    #[error("installing probes failed: {0}")]
    Probe(#[source] EngineError),
}

/**
    Failures of the dynamic attach handler.
*/
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("pad {pad} offers {offered}, first stage accepts {accepted}")]
    Incompatible {
        pad: PadRef,
        offered: String,
        accepted: String,
    },
    #[error("first stage input is already linked to {0}")]
    TargetBusy(PadRef),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

/**
    Configuration errors, fatal at startup.
*/
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid locator '{uri}': {reason}")]
    Locator { uri: String, reason: String },
    #[error("{0}")]
    Invalid(String),
}
