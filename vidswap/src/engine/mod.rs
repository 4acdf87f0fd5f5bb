/*!
    The pipeline engine surface the relay drives.

    The engine owns the graph, its threads and its clock. Everything in this
    crate talks to it through [`Engine`], so the swap protocol can run against
    the in-process [`sim::SimEngine`] as well as a real GStreamer pipeline.
*/

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::EngineError;

pub mod caps;
#[cfg(feature = "gst")]
pub mod gst;
pub mod sim;

pub use caps::{Caps, CapsStructure};

pub type Result<T> = std::result::Result<T, EngineError>;

/**
    Identity of a node created by an engine. Stable for the node's lifetime.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/**
    A named connection point on a node.
*/
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PadRef {
    pub node: NodeId,
    pub name: String,
}

impl PadRef {
    pub fn new(node: NodeId, name: impl Into<String>) -> Self {
        Self {
            node,
            name: name.into(),
        }
    }
}

impl fmt::Display for PadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.name)
    }
}

/**
    Node property values.
*/
#[derive(Clone, Debug, PartialEq)]
pub enum PropValue {
    Str(String),
    Int(i64),
    UInt(u64),
    Bool(bool),
}

impl fmt::Display for PropValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "{}", s),
            Self::Int(v) => write!(f, "{}", v),
            Self::UInt(v) => write!(f, "{}", v),
            Self::Bool(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for PropValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for PropValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for PropValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for PropValue {
    fn from(value: u32) -> Self {
        Self::UInt(value.into())
    }
}

impl From<u16> for PropValue {
    fn from(value: u16) -> Self {
        Self::UInt(value.into())
    }
}

impl From<bool> for PropValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/**
    Run state of the pipeline or of a single node.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunState {
    Null,
    Ready,
    Paused,
    Playing,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Null => "null",
            Self::Ready => "ready",
            Self::Paused => "paused",
            Self::Playing => "playing",
        };
        f.write_str(name)
    }
}

/**
    How a probe intercepts the data flowing through its pad.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeMode {
    /// See every item; the callback decides whether it continues.
    Observe,
    /// Returning [`ProbeReturn::Ok`] holds the item, and everything queued
    /// behind it, until the probe is removed.
    Block,
    /// Drop everything while installed.
    BlockDrop,
}

/**
    Verdict of a probe callback.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeReturn {
    /// Default handling for the probe's mode.
    Ok,
    /// Let the item through, even past a block.
    Pass,
    /// Discard the item.
    Drop,
    /// Remove this probe and let the item continue.
    Remove,
}

/**
    In-band events carried alongside buffers.
*/
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    StreamStart,
    Eos,
    Other(String),
}

/**
    What a probe callback gets to look at.
*/
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeData {
    Buffer { pts: Option<Duration>, size: usize },
    Event(EventKind),
}

impl ProbeData {
    pub fn is_buffer(&self) -> bool {
        matches!(self, Self::Buffer { .. })
    }

    pub fn is_eos(&self) -> bool {
        matches!(self, Self::Event(EventKind::Eos))
    }
}

/**
    Handle of an installed probe, unique per engine.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProbeId(pub u64);

pub type ProbeCallback = Arc<dyn Fn(&PadRef, &ProbeData) -> ProbeReturn + Send + Sync>;
pub type PadAddedCallback = Arc<dyn Fn(NodeId, &PadRef) + Send + Sync>;
pub type AsyncTask = Box<dyn FnOnce() + Send>;

/**
    Pipeline-wide messages.
*/
#[derive(Clone, Debug, PartialEq)]
pub enum BusMessage {
    Error { source: String, message: String },
    Warning { source: String, message: String },
    Eos,
    StateChanged { old: RunState, new: RunState },
}

pub type BusReceiver = mpsc::UnboundedReceiver<BusMessage>;

/**
    The operations the relay needs from a pipeline engine.

    Implementations must be safe to call from any thread, including from
    inside their own probe and pad-added callbacks: callbacks run without
    engine locks held.
*/
pub trait Engine: Send + Sync {
    /// Create a node by factory name. The node is not in the graph yet.
    fn make_node(&self, factory: &str, name: &str) -> Result<NodeId>;

    fn set_property(&self, node: NodeId, key: &str, value: PropValue) -> Result<()>;

    /// Insert a created node into the graph.
    fn add(&self, node: NodeId) -> Result<()>;

    /// Unlink every pad of the node, stop it and destroy it.
    fn remove(&self, node: NodeId) -> Result<()>;

    fn static_pad(&self, node: NodeId, name: &str) -> Result<PadRef>;

    /// Caps currently produced (source pads) or accepted (sink pads).
    fn pad_caps(&self, pad: &PadRef) -> Result<Caps>;

    fn peer(&self, pad: &PadRef) -> Option<PadRef>;

    fn link(&self, src: &PadRef, sink: &PadRef) -> Result<()>;

    /// Link two consecutive nodes. The default joins the static "src" and
    /// "sink" pads; backends with request pads override it.
    fn link_nodes(&self, src: NodeId, sink: NodeId) -> Result<()> {
        let src_pad = self.static_pad(src, "src")?;
        let sink_pad = self.static_pad(sink, "sink")?;
        self.link(&src_pad, &sink_pad)
    }

    fn unlink(&self, src: &PadRef, sink: &PadRef) -> Result<()>;

    fn add_probe(&self, pad: &PadRef, mode: ProbeMode, callback: ProbeCallback) -> Result<ProbeId>;

    /// Removing an unknown probe is a no-op. Items held by a block probe are
    /// released downstream.
    fn remove_probe(&self, pad: &PadRef, probe: ProbeId);

    /// Inject an end-of-stream marker at a pad. The pad must not be held by a
    /// block probe of its own.
    fn send_eos(&self, pad: &PadRef) -> Result<()>;

    fn set_state(&self, state: RunState) -> Result<()>;

    fn state(&self) -> RunState;

    /// Bring a node added to a running graph up to the graph's state.
    fn sync_node_state(&self, node: NodeId) -> Result<()>;

    fn connect_pad_added(&self, node: NodeId, callback: PadAddedCallback) -> Result<()>;

    /// Run `task` off the streaming threads.
    fn call_async(&self, task: AsyncTask);

    fn watch_bus(&self) -> BusReceiver;
}

/**
    Convenience helpers on top of [`Engine`].
*/
pub trait EngineExt: Engine {
    /// Create a node, apply properties and add it to the graph. A node that
    /// fails configuration is destroyed again.
    fn add_node(
        &self,
        factory: &str,
        name: &str,
        properties: &[(String, PropValue)],
    ) -> Result<NodeId> {
        let node = self.make_node(factory, name)?;
        let configured = properties
            .iter()
            .try_for_each(|(key, value)| self.set_property(node, key, value.clone()))
            .and_then(|()| self.add(node));
        if let Err(e) = configured {
            let _ = self.remove(node);
            return Err(e);
        }
        Ok(node)
    }
}

impl<E: Engine + ?Sized> EngineExt for E {}
