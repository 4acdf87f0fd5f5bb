/*!
    [`Engine`] backed by a GStreamer pipeline.

    Node and probe handles are plain integers mapped onto the GStreamer
    objects. Bus messages are pumped by a small thread into every channel
    handed out by [`Engine::watch_bus`].
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{
    AsyncTask, BusMessage, BusReceiver, Caps, Engine, EventKind, NodeId, PadAddedCallback, PadRef,
    ProbeCallback, ProbeData, ProbeId, ProbeMode, ProbeReturn, PropValue, Result, RunState,
};
use crate::error::{EngineError, LinkFailure};

const BUS_POLL: gst::ClockTime = gst::ClockTime::from_mseconds(100);

struct Inner {
    pipeline: gst::Pipeline,
    nodes: Mutex<HashMap<NodeId, gst::Element>>,
    probes: Mutex<HashMap<ProbeId, (gst::Pad, gst::PadProbeId)>>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<BusMessage>>>,
    next_node: AtomicU64,
    next_probe: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

pub struct GstEngine {
    inner: Arc<Inner>,
}

impl GstEngine {
    /// Initialise GStreamer and create an empty pipeline.
    pub fn new() -> Result<Self> {
        gst::init().map_err(|e| EngineError::Unavailable(e.to_string()))?;
        let pipeline = gst::Pipeline::with_name("vidswap");
        let bus = pipeline
            .bus()
            .ok_or_else(|| EngineError::Unavailable("pipeline has no bus".to_string()))?;

        let inner = Arc::new(Inner {
            pipeline,
            nodes: Mutex::new(HashMap::new()),
            probes: Mutex::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
            next_node: AtomicU64::new(1),
            next_probe: AtomicU64::new(1),
        });

        let weak = Arc::downgrade(&inner);
        thread::Builder::new()
            .name("vidswap-bus".to_string())
            .spawn(move || pump_bus(bus, weak))
            .map_err(|e| EngineError::Unavailable(format!("cannot start bus thread: {}", e)))?;

        Ok(Self { inner })
    }

    fn element(&self, node: NodeId) -> Result<gst::Element> {
        self.inner
            .nodes
            .lock()
            .get(&node)
            .cloned()
            .ok_or(EngineError::NoSuchNode(node))
    }

    fn pad(&self, pad: &PadRef) -> Result<gst::Pad> {
        self.element(pad.node)?
            .static_pad(&pad.name)
            .ok_or_else(|| EngineError::NoSuchPad {
                node: pad.node,
                pad: pad.name.clone(),
            })
    }

    fn pad_ref(&self, pad: &gst::Pad) -> Option<PadRef> {
        let parent = pad.parent_element()?;
        let node = self
            .inner
            .nodes
            .lock()
            .iter()
            .find(|(_, element)| **element == parent)
            .map(|(id, _)| *id)?;
        Some(PadRef::new(node, pad.name().as_str()))
    }
}

fn pump_bus(bus: gst::Bus, engine: Weak<Inner>) {
    loop {
        let message = bus.timed_pop(BUS_POLL);
        let Some(inner) = engine.upgrade() else {
            break;
        };
        let Some(message) = message.and_then(|m| translate(&inner.pipeline, &m)) else {
            continue;
        };
        inner
            .watchers
            .lock()
            .retain(|tx| tx.send(message.clone()).is_ok());
    }
    debug!("bus thread finished");
}

fn translate(pipeline: &gst::Pipeline, message: &gst::Message) -> Option<BusMessage> {
    let source = || {
        message
            .src()
            .map(|s| s.path_string().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    };
    match message.view() {
        gst::MessageView::Error(err) => Some(BusMessage::Error {
            source: source(),
            message: match err.debug() {
                Some(debug) => format!("{} ({})", err.error(), debug),
                None => err.error().to_string(),
            },
        }),
        gst::MessageView::Warning(warning) => Some(BusMessage::Warning {
            source: source(),
            message: warning.error().to_string(),
        }),
        gst::MessageView::Eos(..) => Some(BusMessage::Eos),
        gst::MessageView::StateChanged(changed)
            if message.src() == Some(pipeline.upcast_ref::<gst::Object>()) =>
        {
            Some(BusMessage::StateChanged {
                old: run_state(changed.old()),
                new: run_state(changed.current()),
            })
        }
        _ => None,
    }
}

fn run_state(state: gst::State) -> RunState {
    match state {
        gst::State::Playing => RunState::Playing,
        gst::State::Paused => RunState::Paused,
        gst::State::Ready => RunState::Ready,
        _ => RunState::Null,
    }
}

fn gst_state(state: RunState) -> gst::State {
    match state {
        RunState::Null => gst::State::Null,
        RunState::Ready => gst::State::Ready,
        RunState::Paused => gst::State::Paused,
        RunState::Playing => gst::State::Playing,
    }
}

fn link_failure(err: gst::PadLinkError, src: &gst::Pad, sink: &gst::Pad) -> LinkFailure {
    match err {
        gst::PadLinkError::WasLinked => LinkFailure::AlreadyLinked,
        gst::PadLinkError::WrongDirection => LinkFailure::WrongDirection,
        gst::PadLinkError::WrongHierarchy => LinkFailure::NotInGraph,
        gst::PadLinkError::Noformat => LinkFailure::Incompatible {
            src_caps: src.query_caps(None).to_string(),
            sink_caps: sink.query_caps(None).to_string(),
        },
        other => LinkFailure::Other(format!("{:?}", other)),
    }
}

fn probe_data(info: &gst::PadProbeInfo) -> Option<ProbeData> {
    match info.data {
        Some(gst::PadProbeData::Buffer(ref buffer)) => Some(ProbeData::Buffer {
            pts: buffer.pts().map(|t| Duration::from_nanos(t.nseconds())),
            size: buffer.size(),
        }),
        Some(gst::PadProbeData::Event(ref event)) => Some(ProbeData::Event(match event.type_() {
            gst::EventType::Eos => EventKind::Eos,
            gst::EventType::StreamStart => EventKind::StreamStart,
            other => EventKind::Other(format!("{:?}", other)),
        })),
        _ => None,
    }
}

fn probe_mask(mode: ProbeMode) -> gst::PadProbeType {
    let data = gst::PadProbeType::BUFFER | gst::PadProbeType::EVENT_DOWNSTREAM;
    match mode {
        ProbeMode::Block => gst::PadProbeType::BLOCK | data,
        ProbeMode::Observe | ProbeMode::BlockDrop => data,
    }
}

fn probe_return(mode: ProbeMode, verdict: ProbeReturn) -> gst::PadProbeReturn {
    match (mode, verdict) {
        (_, ProbeReturn::Remove) => gst::PadProbeReturn::Remove,
        (_, ProbeReturn::Drop) | (ProbeMode::BlockDrop, ProbeReturn::Ok) => {
            gst::PadProbeReturn::Drop
        }
        (_, ProbeReturn::Pass) => gst::PadProbeReturn::Pass,
        (_, ProbeReturn::Ok) => gst::PadProbeReturn::Ok,
    }
}

impl Engine for GstEngine {
    fn make_node(&self, factory: &str, name: &str) -> Result<NodeId> {
        let element = gst::ElementFactory::make(factory)
            .name(name)
            .build()
            .map_err(|e| EngineError::Create {
                factory: factory.to_string(),
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        let node = NodeId(self.inner.next_node.fetch_add(1, Ordering::Relaxed));
        self.inner.nodes.lock().insert(node, element);
        trace!(%node, factory, name, "element created");
        Ok(node)
    }

    fn set_property(&self, node: NodeId, key: &str, value: PropValue) -> Result<()> {
        let element = self.element(node)?;
        let property_error = |reason: String| EngineError::Property {
            node,
            key: key.to_string(),
            reason,
        };
        let pspec = element
            .find_property(key)
            .ok_or_else(|| property_error("no such property".to_string()))?;
        let value = match value {
            PropValue::Str(s) if pspec.value_type() == String::static_type() => s.to_value(),
            other => glib::Value::deserialize(&other.to_string(), pspec.value_type())
                .map_err(|e| property_error(e.to_string()))?,
        };
        element.set_property_from_value(key, &value);
        Ok(())
    }

    fn add(&self, node: NodeId) -> Result<()> {
        let element = self.element(node)?;
        self.inner.pipeline.add(&element).map_err(|e| EngineError::Graph {
            node,
            reason: e.to_string(),
        })
    }

    fn remove(&self, node: NodeId) -> Result<()> {
        let element = self
            .inner
            .nodes
            .lock()
            .remove(&node)
            .ok_or(EngineError::NoSuchNode(node))?;
        for pad in element.pads() {
            let Some(peer) = pad.peer() else {
                continue;
            };
            let unlinked = match pad.direction() {
                gst::PadDirection::Src => pad.unlink(&peer),
                _ => peer.unlink(&pad),
            };
            if let Err(e) = unlinked {
                warn!(%node, pad = %pad.name(), error = %e, "unlink during removal failed");
            }
        }
        if let Err(e) = element.set_state(gst::State::Null) {
            warn!(%node, error = %e, "element did not reach null");
        }
        if element.parent().is_some() {
            self.inner.pipeline.remove(&element).map_err(|e| EngineError::Graph {
                node,
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    fn static_pad(&self, node: NodeId, name: &str) -> Result<PadRef> {
        let pad = PadRef::new(node, name);
        self.pad(&pad)?;
        Ok(pad)
    }

    fn pad_caps(&self, pad: &PadRef) -> Result<Caps> {
        let gst_pad = self.pad(pad)?;
        let caps = gst_pad
            .current_caps()
            .unwrap_or_else(|| gst_pad.query_caps(None));
        caps.to_string()
            .parse::<Caps>()
            .map_err(|e| EngineError::Unavailable(format!("caps on {}: {}", pad, e)))
    }

    fn peer(&self, pad: &PadRef) -> Option<PadRef> {
        let peer = self.pad(pad).ok()?.peer()?;
        self.pad_ref(&peer)
    }

    fn link(&self, src: &PadRef, sink: &PadRef) -> Result<()> {
        let src_pad = self.pad(src)?;
        let sink_pad = self.pad(sink)?;
        src_pad
            .link(&sink_pad)
            .map(|_| ())
            .map_err(|e| EngineError::Link {
                src: src.clone(),
                sink: sink.clone(),
                reason: link_failure(e, &src_pad, &sink_pad),
            })
    }

    // Element linking also covers request pads (mpegtsmux sinks).
    fn link_nodes(&self, src: NodeId, sink: NodeId) -> Result<()> {
        let src_element = self.element(src)?;
        let sink_element = self.element(sink)?;
        src_element
            .link(&sink_element)
            .map_err(|e| EngineError::Link {
                src: PadRef::new(src, "src"),
                sink: PadRef::new(sink, "sink"),
                reason: LinkFailure::Other(e.to_string()),
            })
    }

    fn unlink(&self, src: &PadRef, sink: &PadRef) -> Result<()> {
        let src_pad = self.pad(src)?;
        let sink_pad = self.pad(sink)?;
        src_pad.unlink(&sink_pad).map_err(|_| EngineError::NotLinked {
            src: src.clone(),
            sink: sink.clone(),
        })
    }

    fn add_probe(&self, pad: &PadRef, mode: ProbeMode, callback: ProbeCallback) -> Result<ProbeId> {
        let gst_pad = self.pad(pad)?;
        let id = ProbeId(self.inner.next_probe.fetch_add(1, Ordering::Relaxed));
        let pad_ref = pad.clone();
        let engine = Arc::downgrade(&self.inner);

        let gst_id = gst_pad
            .add_probe(probe_mask(mode), move |_, info| {
                let Some(data) = probe_data(info) else {
                    return gst::PadProbeReturn::Pass;
                };
                let verdict = callback(&pad_ref, &data);
                if verdict == ProbeReturn::Remove {
                    if let Some(inner) = engine.upgrade() {
                        inner.probes.lock().remove(&id);
                    }
                }
                probe_return(mode, verdict)
            })
            .ok_or_else(|| EngineError::Unavailable(format!("cannot add probe on {}", pad)))?;

        self.inner.probes.lock().insert(id, (gst_pad, gst_id));
        Ok(id)
    }

    fn remove_probe(&self, _pad: &PadRef, probe: ProbeId) {
        let removed = self.inner.probes.lock().remove(&probe);
        if let Some((pad, gst_id)) = removed {
            pad.remove_probe(gst_id);
        }
    }

    fn send_eos(&self, pad: &PadRef) -> Result<()> {
        let gst_pad = self.pad(pad)?;
        if !gst_pad.send_event(gst::event::Eos::new()) {
            debug!(%pad, "end-of-stream not accepted");
        }
        Ok(())
    }

    fn set_state(&self, state: RunState) -> Result<()> {
        self.inner
            .pipeline
            .set_state(gst_state(state))
            .map(|_| ())
            .map_err(|e| EngineError::StateChange {
                state: state.to_string(),
                reason: e.to_string(),
            })
    }

    fn state(&self) -> RunState {
        run_state(self.inner.pipeline.current_state())
    }

    fn sync_node_state(&self, node: NodeId) -> Result<()> {
        self.element(node)?
            .sync_state_with_parent()
            .map_err(|e| EngineError::StateChange {
                state: format!("parent state for {}", node),
                reason: e.to_string(),
            })
    }

    fn connect_pad_added(&self, node: NodeId, callback: PadAddedCallback) -> Result<()> {
        self.element(node)?.connect_pad_added(move |_, pad| {
            callback(node, &PadRef::new(node, pad.name().as_str()));
        });
        Ok(())
    }

    fn call_async(&self, task: AsyncTask) {
        self.inner.pipeline.call_async(move |_| task());
    }

    fn watch_bus(&self) -> BusReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.watchers.lock().push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_states_map_both_ways() {
        for state in [RunState::Null, RunState::Ready, RunState::Paused, RunState::Playing] {
            assert_eq!(run_state(gst_state(state)), state);
        }
        assert_eq!(run_state(gst::State::VoidPending), RunState::Null);
    }

    #[test]
    fn block_drop_discards_on_ok() {
        assert_eq!(
            probe_return(ProbeMode::BlockDrop, ProbeReturn::Ok),
            gst::PadProbeReturn::Drop
        );
        assert_eq!(
            probe_return(ProbeMode::Block, ProbeReturn::Ok),
            gst::PadProbeReturn::Ok
        );
        assert_eq!(
            probe_return(ProbeMode::Block, ProbeReturn::Pass),
            gst::PadProbeReturn::Pass
        );
        assert!(probe_mask(ProbeMode::Block).contains(gst::PadProbeType::BLOCK));
        assert!(!probe_mask(ProbeMode::Observe).contains(gst::PadProbeType::BLOCK));
    }
}
