/*!
    In-process pipeline engine.

    Data moves only when driven: [`SimEngine::push`] emits one buffer from a
    source node and carries it through probes and stages on the calling
    thread, the way a push-mode streaming thread would. Stages hold a fixed
    number of buffers to model codec latency, and `call_async` work is queued
    until [`SimEngine::run_async`] (or [`SimEngine::pump`]) runs it.

    Each node has a stream lock, held while an item is chained into it. Two
    threads feeding the same node take turns, as they would on a real pad.
*/

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use url::Url;

use super::{
    AsyncTask, BusMessage, BusReceiver, Caps, CapsStructure, Engine, EventKind, NodeId,
    PadAddedCallback, PadRef, ProbeCallback, ProbeData, ProbeId, ProbeMode, ProbeReturn,
    PropValue, Result, RunState,
};
use crate::error::{EngineError, LinkFailure};

const FRAME_DURATION: Duration = Duration::from_millis(40);
const SOURCE_PAD: &str = "recv_rtp_src_0";
const SOURCE_SCHEMES: &[&str] = &[
    "rtsp", "rtsps", "rtspt", "udp", "srt", "file", "http", "https",
];

/**
    A buffer produced by a simulated source.
*/
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimBuffer {
    /// Location of the source that produced it.
    pub origin: String,
    pub seq: u64,
    pub pts: Duration,
}

/**
    Anything that travels through the simulated graph.
*/
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Item {
    Buffer(SimBuffer),
    Event(EventKind),
}

impl Item {
    pub fn as_buffer(&self) -> Option<&SimBuffer> {
        match self {
            Self::Buffer(buffer) => Some(buffer),
            Self::Event(_) => None,
        }
    }

    pub fn is_eos(&self) -> bool {
        matches!(self, Self::Event(EventKind::Eos))
    }

    fn probe_data(&self) -> ProbeData {
        match self {
            Self::Buffer(buffer) => ProbeData::Buffer {
                pts: Some(buffer.pts),
                size: 1400,
            },
            Self::Event(kind) => ProbeData::Event(kind.clone()),
        }
    }
}

/**
    Outcome of pushing one item.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowResult {
    Ok,
    /// Parked behind a block probe.
    Held,
    Dropped,
    NotLinked,
    /// The receiving node is not running.
    Flushing,
    NotFound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Source,
    Stage,
    Sink,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    Src,
    Sink,
}

struct FactorySpec {
    role: Role,
    sink: Option<Caps>,
    src: Option<Caps>,
    latency: usize,
    properties: &'static [&'static str],
}

fn factory_spec(factory: &str) -> Option<FactorySpec> {
    let media = |media_type: &str| Caps::single(CapsStructure::new(media_type));
    let spec = match factory {
        "rtspsrc" | "urisrc" => FactorySpec {
            role: Role::Source,
            sink: None,
            src: None,
            latency: 0,
            properties: &["location", "latency", "protocols"],
        },
        "rtph264depay" => FactorySpec {
            role: Role::Stage,
            sink: Some(Caps::rtp_h264()),
            src: Some(media("video/x-h264")),
            latency: 1,
            properties: &[],
        },
        "avdec_h264" => FactorySpec {
            role: Role::Stage,
            sink: Some(media("video/x-h264")),
            src: Some(media("video/x-raw")),
            latency: 2,
            properties: &["max-threads"],
        },
        "videoconvert" => FactorySpec {
            role: Role::Stage,
            sink: Some(media("video/x-raw")),
            src: Some(media("video/x-raw")),
            latency: 0,
            properties: &[],
        },
        "x264enc" => FactorySpec {
            role: Role::Stage,
            sink: Some(media("video/x-raw")),
            src: Some(media("video/x-h264")),
            latency: 3,
            properties: &["tune", "bitrate", "speed-preset", "key-int-max"],
        },
        "mpegtsmux" => FactorySpec {
            role: Role::Stage,
            sink: Some(media("video/x-h264")),
            src: Some(media("video/mpegts")),
            latency: 0,
            properties: &["alignment"],
        },
        "queue" => FactorySpec {
            role: Role::Stage,
            sink: Some(Caps::any()),
            src: Some(Caps::any()),
            latency: 0,
            properties: &["max-size-buffers", "leaky"],
        },
        "rtspclientsink" => FactorySpec {
            role: Role::Sink,
            sink: Some(Caps::any()),
            src: None,
            latency: 0,
            properties: &["location", "latency", "protocols"],
        },
        "udpsink" => FactorySpec {
            role: Role::Sink,
            sink: Some(Caps::any()),
            src: None,
            latency: 0,
            properties: &["host", "port", "sync"],
        },
        "fakesink" => FactorySpec {
            role: Role::Sink,
            sink: Some(Caps::any()),
            src: None,
            latency: 0,
            properties: &["sync"],
        },
        _ => return None,
    };
    Some(spec)
}

/// Caps a source announces, chosen by the scheme of its location.
fn source_caps(location: &str) -> Caps {
    let scheme = Url::parse(location)
        .map(|url| url.scheme().to_string())
        .unwrap_or_default();
    match scheme.as_str() {
        "file" | "http" | "https" => Caps::single(CapsStructure::new("video/quicktime")),
        "srt" => Caps::single(CapsStructure::new("video/mpegts").field("systemstream", "true")),
        _ => Caps::single(
            CapsStructure::new("application/x-rtp")
                .field("media", "video")
                .field("clock-rate", "90000")
                .field("encoding-name", "H264"),
        ),
    }
}

fn validate_location(value: &PropValue) -> std::result::Result<(), String> {
    let PropValue::Str(location) = value else {
        return Err("location must be a string".to_string());
    };
    let url = Url::parse(location).map_err(|e| e.to_string())?;
    if !SOURCE_SCHEMES.contains(&url.scheme()) {
        return Err(format!("unsupported scheme '{}'", url.scheme()));
    }
    Ok(())
}

#[derive(Clone)]
struct SimProbe {
    id: ProbeId,
    mode: ProbeMode,
    callback: ProbeCallback,
}

struct SimPad {
    name: String,
    direction: Direction,
    caps: Caps,
    peer: Option<PadRef>,
    probes: Vec<SimProbe>,
    held: VecDeque<Item>,
}

impl SimPad {
    fn new(name: &str, direction: Direction, caps: Caps) -> Self {
        Self {
            name: name.to_string(),
            direction,
            caps,
            peer: None,
            probes: Vec::new(),
            held: VecDeque::new(),
        }
    }
}

struct SimNode {
    name: String,
    role: Role,
    allowed: &'static [&'static str],
    properties: BTreeMap<String, PropValue>,
    in_graph: bool,
    state: RunState,
    pads: Vec<SimPad>,
    pad_added: Vec<PadAddedCallback>,
    queue: VecDeque<Item>,
    latency: usize,
    next_seq: u64,
    announced: bool,
    received: Vec<Item>,
    stream: Arc<ReentrantMutex<()>>,
}

impl SimNode {
    fn pad(&self, name: &str) -> Option<&SimPad> {
        self.pads.iter().find(|p| p.name == name)
    }

    fn location(&self) -> Option<String> {
        match self.properties.get("location") {
            Some(PropValue::Str(location)) => Some(location.clone()),
            _ => None,
        }
    }
}

struct Graph {
    nodes: HashMap<NodeId, SimNode>,
    state: RunState,
    created: Vec<String>,
    hold_announcements: bool,
    pending_announcements: Vec<NodeId>,
}

impl Graph {
    fn pad(&self, pad: &PadRef) -> Option<&SimPad> {
        self.nodes.get(&pad.node)?.pad(&pad.name)
    }

    fn pad_mut(&mut self, pad: &PadRef) -> Option<&mut SimPad> {
        self.nodes
            .get_mut(&pad.node)?
            .pads
            .iter_mut()
            .find(|p| p.name == pad.name)
    }

    fn node(&self, node: NodeId) -> Result<&SimNode> {
        self.nodes.get(&node).ok_or(EngineError::NoSuchNode(node))
    }

    fn node_mut(&mut self, node: NodeId) -> Result<&mut SimNode> {
        self.nodes.get_mut(&node).ok_or(EngineError::NoSuchNode(node))
    }
}

enum Probed {
    Continue(Item),
    Stopped(FlowResult),
}

struct Inner {
    graph: Mutex<Graph>,
    tasks: Mutex<VecDeque<AsyncTask>>,
    bus: Mutex<Vec<mpsc::UnboundedSender<BusMessage>>>,
    next_node: AtomicU64,
    next_probe: AtomicU64,
}

/**
    Deterministic engine used by the tests and the `simulate` command.

    Cloning shares the same graph.
*/
#[derive(Clone)]
pub struct SimEngine {
    inner: Arc<Inner>,
}

impl Default for SimEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SimEngine {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                graph: Mutex::new(Graph {
                    nodes: HashMap::new(),
                    state: RunState::Null,
                    created: Vec::new(),
                    hold_announcements: false,
                    pending_announcements: Vec::new(),
                }),
                tasks: Mutex::new(VecDeque::new()),
                bus: Mutex::new(Vec::new()),
                next_node: AtomicU64::new(1),
                next_probe: AtomicU64::new(1),
            }),
        }
    }

    /**
        While held, sources reaching `Playing` do not announce their output
        pad. Releasing announces everything that was held back.
    */
    pub fn hold_announcements(&self, hold: bool) {
        let pending = {
            let mut graph = self.inner.graph.lock();
            graph.hold_announcements = hold;
            if hold {
                Vec::new()
            } else {
                std::mem::take(&mut graph.pending_announcements)
            }
        };
        for node in pending {
            self.announce(node);
        }
    }

    /**
        Emit one buffer from a source node.
    */
    pub fn push(&self, source: NodeId) -> FlowResult {
        let (pad, item) = {
            let mut graph = self.inner.graph.lock();
            let Some(node) = graph.nodes.get_mut(&source) else {
                return FlowResult::NotFound;
            };
            if node.role != Role::Source || !node.announced {
                return FlowResult::NotLinked;
            }
            if node.state != RunState::Playing {
                return FlowResult::Flushing;
            }
            let seq = node.next_seq;
            node.next_seq += 1;
            let origin = node.location().unwrap_or_else(|| node.name.clone());
            let pts = FRAME_DURATION.saturating_mul(u32::try_from(seq).unwrap_or(u32::MAX));
            (
                PadRef::new(source, SOURCE_PAD),
                Item::Buffer(SimBuffer { origin, seq, pts }),
            )
        };
        self.push_downstream(&pad, item)
    }

    /**
        Run queued async work, then push one buffer from every playing source
        with an announced pad. Returns how many buffers made it through.
    */
    pub fn pump(&self) -> usize {
        self.run_async();
        let mut sources: Vec<NodeId> = {
            let graph = self.inner.graph.lock();
            graph
                .nodes
                .iter()
                .filter(|(_, n)| {
                    n.role == Role::Source && n.announced && n.state == RunState::Playing
                })
                .map(|(id, _)| *id)
                .collect()
        };
        sources.sort();
        sources
            .into_iter()
            .filter(|source| self.push(*source) == FlowResult::Ok)
            .count()
    }

    /**
        Run queued `call_async` tasks, including any they queue themselves.
    */
    pub fn run_async(&self) -> usize {
        let mut ran = 0;
        loop {
            let task = self.inner.tasks.lock().pop_front();
            let Some(task) = task else {
                break;
            };
            task();
            ran += 1;
        }
        ran
    }

    pub fn pending_tasks(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    /// Everything a sink node has received, in arrival order.
    pub fn sink_log(&self, node: NodeId) -> Vec<Item> {
        self.inner
            .graph
            .lock()
            .nodes
            .get(&node)
            .map(|n| n.received.clone())
            .unwrap_or_default()
    }

    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.inner
            .graph
            .lock()
            .nodes
            .iter()
            .find(|(_, n)| n.name == name)
            .map(|(id, _)| *id)
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.inner.graph.lock().nodes.contains_key(&node)
    }

    /// Number of nodes ever created from `factory`.
    pub fn created(&self, factory: &str) -> usize {
        self.inner
            .graph
            .lock()
            .created
            .iter()
            .filter(|f| f.as_str() == factory)
            .count()
    }

    pub fn property(&self, node: NodeId, key: &str) -> Option<PropValue> {
        self.inner
            .graph
            .lock()
            .nodes
            .get(&node)
            .and_then(|n| n.properties.get(key).cloned())
    }

    pub fn probe_count(&self, pad: &PadRef) -> usize {
        self.inner
            .graph
            .lock()
            .pad(pad)
            .map(|p| p.probes.len())
            .unwrap_or(0)
    }

    pub fn held_count(&self, pad: &PadRef) -> usize {
        self.inner
            .graph
            .lock()
            .pad(pad)
            .map(|p| p.held.len())
            .unwrap_or(0)
    }

    /// Deliver a message to every bus watcher.
    pub fn post(&self, message: BusMessage) {
        self.inner
            .bus
            .lock()
            .retain(|tx| tx.send(message.clone()).is_ok());
    }

    fn probe_installed(&self, pad: &PadRef, probe: ProbeId) -> bool {
        self.inner
            .graph
            .lock()
            .pad(pad)
            .is_some_and(|p| p.probes.iter().any(|x| x.id == probe))
    }

    fn push_downstream(&self, src: &PadRef, item: Item) -> FlowResult {
        match self.run_probes(src, item) {
            Probed::Continue(item) => self.forward(src, item),
            Probed::Stopped(result) => result,
        }
    }

    fn stream_lock(&self, node: NodeId) -> Option<Arc<ReentrantMutex<()>>> {
        self.inner
            .graph
            .lock()
            .nodes
            .get(&node)
            .map(|n| Arc::clone(&n.stream))
    }

    // Hand an item that already passed `src`'s probes to its peer.
    fn forward(&self, src: &PadRef, item: Item) -> FlowResult {
        let peer = self.inner.graph.lock().pad(src).and_then(|p| p.peer.clone());
        let Some(sink) = peer else {
            return FlowResult::NotLinked;
        };
        let Some(stream) = self.stream_lock(sink.node) else {
            return FlowResult::NotFound;
        };
        let _stream = stream.lock();
        match self.run_probes(&sink, item) {
            Probed::Continue(item) => self.chain(sink.node, item),
            Probed::Stopped(result) => result,
        }
    }

    fn run_probes(&self, pad: &PadRef, item: Item) -> Probed {
        let probes = {
            let mut graph = self.inner.graph.lock();
            let Some(sim_pad) = graph.pad_mut(pad) else {
                return Probed::Stopped(FlowResult::NotFound);
            };
            if !sim_pad.held.is_empty() && item.as_buffer().is_some() {
                sim_pad.held.push_back(item);
                return Probed::Stopped(FlowResult::Held);
            }
            sim_pad.probes.clone()
        };

        let data = item.probe_data();
        for probe in probes {
            if !self.probe_installed(pad, probe.id) {
                continue;
            }
            match (probe.mode, (probe.callback)(pad, &data)) {
                (_, ProbeReturn::Remove) => self.remove_probe(pad, probe.id),
                (ProbeMode::BlockDrop, _) | (_, ProbeReturn::Drop) => {
                    return Probed::Stopped(FlowResult::Dropped);
                }
                (ProbeMode::Block, ProbeReturn::Ok) => {
                    let mut graph = self.inner.graph.lock();
                    let Some(sim_pad) = graph.pad_mut(pad) else {
                        return Probed::Stopped(FlowResult::NotFound);
                    };
                    if sim_pad.probes.iter().any(|x| x.id == probe.id) {
                        sim_pad.held.push_back(item);
                        return Probed::Stopped(FlowResult::Held);
                    }
                }
                _ => {}
            }
        }
        Probed::Continue(item)
    }

    fn chain(&self, node_id: NodeId, item: Item) -> FlowResult {
        let outputs = {
            let mut graph = self.inner.graph.lock();
            let Some(node) = graph.nodes.get_mut(&node_id) else {
                return FlowResult::NotFound;
            };
            if node.state < RunState::Paused {
                return FlowResult::Flushing;
            }
            match node.role {
                Role::Source => return FlowResult::NotLinked,
                Role::Sink => {
                    let eos = item.is_eos();
                    trace!(node = %node.name, ?item, "sink received");
                    node.received.push(item);
                    drop(graph);
                    if eos {
                        self.post(BusMessage::Eos);
                    }
                    return FlowResult::Ok;
                }
                Role::Stage => {
                    let mut out = Vec::new();
                    match item {
                        Item::Buffer(_) => {
                            node.queue.push_back(item);
                            while node.queue.len() > node.latency {
                                out.extend(node.queue.pop_front());
                            }
                        }
                        Item::Event(EventKind::Eos) => {
                            out.extend(node.queue.drain(..));
                            out.push(item);
                        }
                        Item::Event(_) => out.push(item),
                    }
                    out
                }
            }
        };

        let src = PadRef::new(node_id, "src");
        let mut result = FlowResult::Ok;
        for item in outputs {
            result = self.push_downstream(&src, item);
        }
        result
    }

    fn announce(&self, node_id: NodeId) {
        let (pad, callbacks) = {
            let mut graph = self.inner.graph.lock();
            if graph.hold_announcements {
                if !graph.pending_announcements.contains(&node_id) {
                    graph.pending_announcements.push(node_id);
                }
                return;
            }
            let Some(node) = graph.nodes.get_mut(&node_id) else {
                return;
            };
            if node.role != Role::Source || node.announced || node.state != RunState::Playing {
                return;
            }
            let caps = source_caps(&node.location().unwrap_or_default());
            node.pads.push(SimPad::new(SOURCE_PAD, Direction::Src, caps));
            node.announced = true;
            debug!(node = %node.name, "source announced {}", SOURCE_PAD);
            (PadRef::new(node_id, SOURCE_PAD), node.pad_added.clone())
        };
        for callback in callbacks {
            callback(node_id, &pad);
        }
    }
}

impl Engine for SimEngine {
    fn make_node(&self, factory: &str, name: &str) -> Result<NodeId> {
        let spec = factory_spec(factory).ok_or_else(|| EngineError::Create {
            factory: factory.to_string(),
            name: name.to_string(),
            reason: "no such factory".to_string(),
        })?;

        let id = NodeId(self.inner.next_node.fetch_add(1, Ordering::Relaxed));
        let mut pads = Vec::new();
        if let Some(caps) = spec.sink {
            pads.push(SimPad::new("sink", Direction::Sink, caps));
        }
        if let Some(caps) = spec.src {
            pads.push(SimPad::new("src", Direction::Src, caps));
        }

        let mut graph = self.inner.graph.lock();
        graph.created.push(factory.to_string());
        graph.nodes.insert(
            id,
            SimNode {
                name: name.to_string(),
                role: spec.role,
                allowed: spec.properties,
                properties: BTreeMap::new(),
                in_graph: false,
                state: RunState::Null,
                pads,
                pad_added: Vec::new(),
                queue: VecDeque::new(),
                latency: spec.latency,
                next_seq: 0,
                announced: false,
                received: Vec::new(),
                stream: Arc::new(ReentrantMutex::new(())),
            },
        );
        Ok(id)
    }

    fn set_property(&self, node: NodeId, key: &str, value: PropValue) -> Result<()> {
        let mut graph = self.inner.graph.lock();
        let sim_node = graph.node_mut(node)?;
        let rejected = |reason: String| EngineError::Property {
            node,
            key: key.to_string(),
            reason,
        };
        if !sim_node.allowed.contains(&key) {
            return Err(rejected("no such property".to_string()));
        }
        if key == "location" && sim_node.role == Role::Source {
            validate_location(&value).map_err(rejected)?;
        }
        sim_node.properties.insert(key.to_string(), value);
        Ok(())
    }

    fn add(&self, node: NodeId) -> Result<()> {
        let mut graph = self.inner.graph.lock();
        let name = graph.node(node)?.name.clone();
        let clash = graph
            .nodes
            .iter()
            .any(|(id, n)| *id != node && n.in_graph && n.name == name);
        if clash {
            return Err(EngineError::Graph {
                node,
                reason: format!("name '{}' already in use", name),
            });
        }
        graph.node_mut(node)?.in_graph = true;
        Ok(())
    }

    fn remove(&self, node: NodeId) -> Result<()> {
        let mut graph = self.inner.graph.lock();
        let removed = graph
            .nodes
            .remove(&node)
            .ok_or(EngineError::NoSuchNode(node))?;
        for pad in &removed.pads {
            let Some(peer) = &pad.peer else {
                continue;
            };
            if let Some(peer_pad) = graph.pad_mut(peer) {
                peer_pad.peer = None;
            }
        }
        graph.pending_announcements.retain(|n| *n != node);
        let flushed: usize = removed.pads.iter().map(|p| p.held.len()).sum();
        if flushed > 0 {
            debug!(node = %removed.name, count = flushed, "flushed held items");
        }
        debug!(node = %removed.name, "removed {}", node);
        Ok(())
    }

    fn static_pad(&self, node: NodeId, name: &str) -> Result<PadRef> {
        let graph = self.inner.graph.lock();
        match graph.node(node)?.pad(name) {
            Some(_) => Ok(PadRef::new(node, name)),
            None => Err(EngineError::NoSuchPad {
                node,
                pad: name.to_string(),
            }),
        }
    }

    fn pad_caps(&self, pad: &PadRef) -> Result<Caps> {
        let graph = self.inner.graph.lock();
        graph
            .node(pad.node)?
            .pad(&pad.name)
            .map(|p| p.caps.clone())
            .ok_or_else(|| EngineError::NoSuchPad {
                node: pad.node,
                pad: pad.name.clone(),
            })
    }

    fn peer(&self, pad: &PadRef) -> Option<PadRef> {
        self.inner.graph.lock().pad(pad).and_then(|p| p.peer.clone())
    }

    fn link(&self, src: &PadRef, sink: &PadRef) -> Result<()> {
        let mut graph = self.inner.graph.lock();
        let fail = |reason: LinkFailure| EngineError::Link {
            src: src.clone(),
            sink: sink.clone(),
            reason,
        };
        let endpoint = |pad: &PadRef, direction: Direction| -> Result<(Caps, bool)> {
            let node = graph.node(pad.node)?;
            let sim_pad = node.pad(&pad.name).ok_or_else(|| EngineError::NoSuchPad {
                node: pad.node,
                pad: pad.name.clone(),
            })?;
            if sim_pad.direction != direction {
                return Err(fail(LinkFailure::WrongDirection));
            }
            if sim_pad.peer.is_some() {
                return Err(fail(LinkFailure::AlreadyLinked));
            }
            Ok((sim_pad.caps.clone(), node.in_graph))
        };

        let (src_caps, src_in_graph) = endpoint(src, Direction::Src)?;
        let (sink_caps, sink_in_graph) = endpoint(sink, Direction::Sink)?;
        if !src_in_graph || !sink_in_graph {
            return Err(fail(LinkFailure::NotInGraph));
        }
        if !src_caps.can_intersect(&sink_caps) {
            return Err(fail(LinkFailure::Incompatible {
                src_caps: src_caps.to_string(),
                sink_caps: sink_caps.to_string(),
            }));
        }

        if let Some(pad) = graph.pad_mut(src) {
            pad.peer = Some(sink.clone());
        }
        if let Some(pad) = graph.pad_mut(sink) {
            pad.peer = Some(src.clone());
        }
        Ok(())
    }

    fn unlink(&self, src: &PadRef, sink: &PadRef) -> Result<()> {
        let mut graph = self.inner.graph.lock();
        let linked = graph.pad(src).and_then(|p| p.peer.as_ref()) == Some(sink)
            && graph.pad(sink).and_then(|p| p.peer.as_ref()) == Some(src);
        if !linked {
            return Err(EngineError::NotLinked {
                src: src.clone(),
                sink: sink.clone(),
            });
        }
        // held items stay queued until their block is lifted
        for pad in [src, sink] {
            if let Some(sim_pad) = graph.pad_mut(pad) {
                sim_pad.peer = None;
            }
        }
        Ok(())
    }

    fn add_probe(&self, pad: &PadRef, mode: ProbeMode, callback: ProbeCallback) -> Result<ProbeId> {
        let id = ProbeId(self.inner.next_probe.fetch_add(1, Ordering::Relaxed));
        let mut graph = self.inner.graph.lock();
        let sim_pad = graph.pad_mut(pad).ok_or_else(|| EngineError::NoSuchPad {
            node: pad.node,
            pad: pad.name.clone(),
        })?;
        sim_pad.probes.push(SimProbe { id, mode, callback });
        Ok(id)
    }

    fn remove_probe(&self, pad: &PadRef, probe: ProbeId) {
        let (direction, released) = {
            let mut graph = self.inner.graph.lock();
            let Some(sim_pad) = graph.pad_mut(pad) else {
                return;
            };
            let before = sim_pad.probes.len();
            sim_pad.probes.retain(|x| x.id != probe);
            if sim_pad.probes.len() == before {
                return;
            }
            let still_blocked = sim_pad.probes.iter().any(|x| x.mode == ProbeMode::Block);
            let released = if still_blocked {
                VecDeque::new()
            } else {
                std::mem::take(&mut sim_pad.held)
            };
            (sim_pad.direction, released)
        };

        if released.is_empty() {
            return;
        }
        let Some(stream) = self.stream_lock(pad.node) else {
            return;
        };
        let _stream = stream.lock();
        for item in released {
            match direction {
                Direction::Src => self.forward(pad, item),
                Direction::Sink => self.chain(pad.node, item),
            };
        }
    }

    fn send_eos(&self, pad: &PadRef) -> Result<()> {
        let (direction, parked) = self
            .inner
            .graph
            .lock()
            .pad(pad)
            .map(|p| (p.direction, !p.held.is_empty()))
            .ok_or_else(|| EngineError::NoSuchPad {
                node: pad.node,
                pad: pad.name.clone(),
            })?;
        // a blocked sink pad keeps its stream lock; a serialized event would never get in
        if direction == Direction::Sink && parked {
            return Err(EngineError::Blocked(pad.clone()));
        }
        let eos = Item::Event(EventKind::Eos);
        match direction {
            Direction::Src => {
                self.push_downstream(pad, eos);
            }
            Direction::Sink => {
                let stream = self
                    .stream_lock(pad.node)
                    .ok_or(EngineError::NoSuchNode(pad.node))?;
                let _stream = stream.lock();
                if let Probed::Continue(item) = self.run_probes(pad, eos) {
                    self.chain(pad.node, item);
                }
            }
        }
        Ok(())
    }

    fn set_state(&self, state: RunState) -> Result<()> {
        let (old, to_announce) = {
            let mut graph = self.inner.graph.lock();
            let old = graph.state;
            graph.state = state;
            let mut to_announce = Vec::new();
            for (id, node) in graph.nodes.iter_mut().filter(|(_, n)| n.in_graph) {
                node.state = state;
                if state < RunState::Paused {
                    node.queue.clear();
                }
                if node.role == Role::Source && state == RunState::Playing && !node.announced {
                    to_announce.push(*id);
                }
            }
            to_announce.sort();
            (old, to_announce)
        };
        if old != state {
            self.post(BusMessage::StateChanged { old, new: state });
        }
        for node in to_announce {
            self.announce(node);
        }
        Ok(())
    }

    fn state(&self) -> RunState {
        self.inner.graph.lock().state
    }

    fn sync_node_state(&self, node: NodeId) -> Result<()> {
        let announce = {
            let mut graph = self.inner.graph.lock();
            let state = graph.state;
            let sim_node = graph.node_mut(node)?;
            if !sim_node.in_graph {
                return Err(EngineError::Graph {
                    node,
                    reason: "not in the graph".to_string(),
                });
            }
            sim_node.state = state;
            sim_node.role == Role::Source && state == RunState::Playing && !sim_node.announced
        };
        if announce {
            self.announce(node);
        }
        Ok(())
    }

    fn connect_pad_added(&self, node: NodeId, callback: PadAddedCallback) -> Result<()> {
        self.inner
            .graph
            .lock()
            .node_mut(node)?
            .pad_added
            .push(callback);
        Ok(())
    }

    fn call_async(&self, task: AsyncTask) {
        self.inner.tasks.lock().push_back(task);
    }

    fn watch_bus(&self) -> BusReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.bus.lock().push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineExt;

    fn chain(engine: &SimEngine) -> (NodeId, NodeId, NodeId) {
        let depay = engine.add_node("rtph264depay", "depay", &[]).unwrap();
        let decoder = engine.add_node("avdec_h264", "decoder", &[]).unwrap();
        let sink = engine.add_node("fakesink", "sink", &[]).unwrap();
        engine.link_nodes(depay, decoder).unwrap();
        engine.link_nodes(decoder, sink).unwrap();
        (depay, decoder, sink)
    }

    fn source(engine: &SimEngine, name: &str, location: &str) -> NodeId {
        let src = engine
            .add_node("rtspsrc", name, &[("location".into(), location.into())])
            .unwrap();
        let engine_cb = engine.clone();
        engine
            .connect_pad_added(
                src,
                Arc::new(move |_, pad: &PadRef| {
                    let depay = engine_cb.node_by_name("depay").unwrap();
                    let sink = engine_cb.static_pad(depay, "sink").unwrap();
                    engine_cb.link(pad, &sink).unwrap();
                }),
            )
            .unwrap();
        src
    }

    fn hold() -> ProbeCallback {
        Arc::new(|_: &PadRef, _: &ProbeData| ProbeReturn::Ok)
    }

    fn buffers(log: &[Item]) -> Vec<u64> {
        log.iter().filter_map(|i| i.as_buffer().map(|b| b.seq)).collect()
    }

    #[test]
    fn unknown_factory_and_property_are_rejected() {
        let engine = SimEngine::new();
        assert!(matches!(
            engine.make_node("nosuchelement", "x"),
            Err(EngineError::Create { .. })
        ));
        let src = engine.make_node("rtspsrc", "src").unwrap();
        assert!(engine.set_property(src, "bogus", 1i64.into()).is_err());
        assert!(engine.set_property(src, "location", "not a url".into()).is_err());
        assert!(engine.set_property(src, "location", "ftp://host/x".into()).is_err());
        assert!(engine.set_property(src, "location", "rtsp://127.0.0.1:8555/test".into()).is_ok());
    }

    #[test]
    fn stage_latency_is_flushed_by_eos() {
        let engine = SimEngine::new();
        let (depay, _decoder, sink) = chain(&engine);
        let src = source(&engine, "src", "rtsp://127.0.0.1:8555/test");
        engine.set_state(RunState::Playing).unwrap();

        for _ in 0..5 {
            engine.push(src);
        }
        // depay holds one, decoder holds two
        assert_eq!(buffers(&engine.sink_log(sink)), vec![0, 1]);

        let depay_sink = engine.static_pad(depay, "sink").unwrap();
        engine.send_eos(&depay_sink).unwrap();
        let log = engine.sink_log(sink);
        assert_eq!(buffers(&log), vec![0, 1, 2, 3, 4]);
        assert!(log.last().unwrap().is_eos());
    }

    #[test]
    fn block_probe_holds_until_removed() {
        let engine = SimEngine::new();
        let (depay, _decoder, sink) = chain(&engine);
        let src = source(&engine, "src", "rtsp://127.0.0.1:8555/test");
        engine.set_state(RunState::Playing).unwrap();

        let pad = engine.static_pad(depay, "sink").unwrap();
        let probe = engine.add_probe(&pad, ProbeMode::Block, hold()).unwrap();
        assert_eq!(engine.push(src), FlowResult::Held);
        assert_eq!(engine.push(src), FlowResult::Held);
        assert_eq!(engine.held_count(&pad), 2);
        assert!(engine.sink_log(sink).is_empty());

        engine.remove_probe(&pad, probe);
        assert_eq!(engine.held_count(&pad), 0);
        for _ in 0..3 {
            engine.push(src);
        }
        assert_eq!(buffers(&engine.sink_log(sink)), vec![0, 1]);
    }

    #[test]
    fn unlink_keeps_held_items_until_release() {
        let engine = SimEngine::new();
        let (depay, _decoder, sink) = chain(&engine);
        let src = source(&engine, "src", "rtsp://127.0.0.1:8555/test");
        engine.set_state(RunState::Playing).unwrap();

        let pad = engine.static_pad(depay, "sink").unwrap();
        let probe = engine.add_probe(&pad, ProbeMode::Block, hold()).unwrap();
        engine.push(src);
        engine.push(src);
        let src_pad = engine.peer(&pad).unwrap();
        engine.unlink(&src_pad, &pad).unwrap();
        assert_eq!(engine.held_count(&pad), 2);
        assert_eq!(engine.push(src), FlowResult::NotLinked);

        engine.remove_probe(&pad, probe);
        assert_eq!(engine.held_count(&pad), 0);
        engine.send_eos(&pad).unwrap();
        assert_eq!(buffers(&engine.sink_log(sink)), vec![0, 1]);
    }

    #[test]
    fn removing_a_node_flushes_its_own_held_items() {
        let engine = SimEngine::new();
        let (depay, _decoder, sink) = chain(&engine);
        let src = source(&engine, "src", "rtsp://127.0.0.1:8555/test");
        engine.set_state(RunState::Playing).unwrap();

        let out = engine.peer(&engine.static_pad(depay, "sink").unwrap()).unwrap();
        let probe = engine.add_probe(&out, ProbeMode::Block, hold()).unwrap();
        assert_eq!(engine.push(src), FlowResult::Held);
        assert_eq!(engine.held_count(&out), 1);

        engine.remove(src).unwrap();
        assert_eq!(engine.held_count(&out), 0);
        // nothing left to release
        engine.remove_probe(&out, probe);
        assert!(engine.sink_log(sink).is_empty());
    }

    #[test]
    fn eos_cannot_enter_a_blocked_sink_pad() {
        let engine = SimEngine::new();
        let (depay, _decoder, sink) = chain(&engine);
        let src = source(&engine, "src", "rtsp://127.0.0.1:8555/test");
        engine.set_state(RunState::Playing).unwrap();

        let pad = engine.static_pad(depay, "sink").unwrap();
        let probe = engine.add_probe(&pad, ProbeMode::Block, hold()).unwrap();
        engine.push(src);
        assert!(matches!(engine.send_eos(&pad), Err(EngineError::Blocked(_))));
        assert!(engine.sink_log(sink).is_empty());

        // blocking the upstream source pad instead leaves the sink pad free
        engine.remove_probe(&pad, probe);
        let out = engine.peer(&pad).unwrap();
        engine.add_probe(&out, ProbeMode::Block, hold()).unwrap();
        assert_eq!(engine.push(src), FlowResult::Held);
        engine.send_eos(&pad).unwrap();
        let log = engine.sink_log(sink);
        assert_eq!(buffers(&log), vec![0]);
        assert!(log.last().unwrap().is_eos());
    }

    #[test]
    fn link_checks_caps_and_occupancy() {
        let engine = SimEngine::new();
        let (depay, _decoder, _sink) = chain(&engine);
        let depay_sink = engine.static_pad(depay, "sink").unwrap();

        let file = engine
            .add_node("urisrc", "file", &[("location".into(), "file:///tmp/a.mp4".into())])
            .unwrap();
        let rtsp = engine
            .add_node("rtspsrc", "rtsp", &[("location".into(), "rtsp://h/a".into())])
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for node in [file, rtsp] {
            let seen = Arc::clone(&seen);
            let record: PadAddedCallback =
                Arc::new(move |_, pad: &PadRef| seen.lock().push(pad.clone()));
            engine.connect_pad_added(node, record).unwrap();
        }
        engine.set_state(RunState::Playing).unwrap();
        let pads = seen.lock().clone();
        assert_eq!(pads.len(), 2);

        let err = engine.link(&pads[0], &depay_sink).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Link {
                reason: LinkFailure::Incompatible { .. },
                ..
            }
        ));
        engine.link(&pads[1], &depay_sink).unwrap();
        let again = engine.link(&pads[1], &depay_sink).unwrap_err();
        assert!(matches!(
            again,
            EngineError::Link {
                reason: LinkFailure::AlreadyLinked,
                ..
            }
        ));
    }

    #[test]
    fn held_announcements_fire_on_release() {
        let engine = SimEngine::new();
        chain(&engine);
        engine.hold_announcements(true);
        let src = source(&engine, "src", "rtsp://127.0.0.1:8555/test");
        engine.set_state(RunState::Playing).unwrap();
        assert_eq!(engine.push(src), FlowResult::NotLinked);

        engine.hold_announcements(false);
        assert_eq!(engine.push(src), FlowResult::Ok);
    }

    #[test]
    fn removed_node_is_gone() {
        let engine = SimEngine::new();
        chain(&engine);
        let src = source(&engine, "src", "rtsp://127.0.0.1:8555/test");
        engine.set_state(RunState::Playing).unwrap();
        engine.remove(src).unwrap();
        assert!(!engine.contains(src));
        assert_eq!(engine.push(src), FlowResult::NotFound);
        let depay = engine.node_by_name("depay").unwrap();
        let pad = engine.static_pad(depay, "sink").unwrap();
        assert!(engine.peer(&pad).is_none());
    }

    #[test]
    fn async_tasks_run_in_order() {
        let engine = SimEngine::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            engine.call_async(Box::new(move || order.lock().push(i)));
        }
        assert_eq!(engine.pending_tasks(), 3);
        assert_eq!(engine.run_async(), 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn bus_reports_state_changes_and_eos() {
        let engine = SimEngine::new();
        let (depay, _, _) = chain(&engine);
        let mut bus = engine.watch_bus();
        engine.set_state(RunState::Playing).unwrap();
        engine.send_eos(&engine.static_pad(depay, "sink").unwrap()).unwrap();
        assert_eq!(
            bus.try_recv().unwrap(),
            BusMessage::StateChanged {
                old: RunState::Null,
                new: RunState::Playing
            }
        );
        assert_eq!(bus.try_recv().unwrap(), BusMessage::Eos);
    }
}
