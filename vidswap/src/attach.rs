use tracing::debug;

use crate::engine::{Engine, PadRef};
use crate::error::AttachError;

/**
    Links a source's freshly announced output pad into the first stage.

    Runs on whichever thread the engine announces pads from. The caps check
    is done up front so an incompatible source is reported with both sides'
    caps instead of a bare link failure.
*/
pub struct AttachHandler<'a> {
    engine: &'a dyn Engine,
    target: &'a PadRef,
}

impl<'a> AttachHandler<'a> {
    pub fn new(engine: &'a dyn Engine, target: &'a PadRef) -> Self {
        Self { engine, target }
    }

    pub fn attach(&self, pad: &PadRef) -> Result<(), AttachError> {
        let offered = self.engine.pad_caps(pad)?;
        let accepted = self.engine.pad_caps(self.target)?;
        if !offered.can_intersect(&accepted) {
            return Err(AttachError::Incompatible {
                pad: pad.clone(),
                offered: offered.to_string(),
                accepted: accepted.to_string(),
            });
        }
        if let Some(peer) = self.engine.peer(self.target) {
            return Err(AttachError::TargetBusy(peer));
        }
        self.engine.link(pad, self.target)?;
        debug!(%pad, target = %self.target, caps = %offered, "linked source output");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::engine::sim::SimEngine;
    use crate::engine::{EngineExt, NodeId, RunState};

    fn announced(engine: &SimEngine, name: &str, location: &str) -> PadRef {
        let node = engine
            .add_node("rtspsrc", name, &[("location".into(), location.into())])
            .unwrap();
        let seen: Arc<Mutex<Option<PadRef>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        engine
            .connect_pad_added(
                node,
                Arc::new(move |_: NodeId, pad: &PadRef| *slot.lock() = Some(pad.clone())),
            )
            .unwrap();
        engine.sync_node_state(node).unwrap();
        let pad = seen.lock().clone();
        pad.unwrap()
    }

    fn first_stage(engine: &SimEngine) -> PadRef {
        let depay = engine.add_node("rtph264depay", "depay", &[]).unwrap();
        engine.set_state(RunState::Playing).unwrap();
        engine.static_pad(depay, "sink").unwrap()
    }

    #[test]
    fn links_compatible_source() {
        let engine = SimEngine::new();
        let target = first_stage(&engine);
        let pad = announced(&engine, "src", "rtsp://127.0.0.1:8555/test");

        AttachHandler::new(&engine, &target).attach(&pad).unwrap();
        assert_eq!(engine.peer(&target), Some(pad));
    }

    #[test]
    fn rejects_incompatible_caps() {
        let engine = SimEngine::new();
        let target = first_stage(&engine);
        let pad = announced(&engine, "src", "file:///tmp/clip.mp4");

        let err = AttachHandler::new(&engine, &target).attach(&pad).unwrap_err();
        match err {
            AttachError::Incompatible { offered, .. } => assert_eq!(offered, "video/quicktime"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(engine.peer(&target).is_none());
    }

    #[test]
    fn rejects_busy_target() {
        let engine = SimEngine::new();
        let target = first_stage(&engine);
        let first = announced(&engine, "a", "rtsp://127.0.0.1:8555/test");
        let second = announced(&engine, "b", "rtsp://127.0.0.1:8555/other");

        let handler = AttachHandler::new(&engine, &target);
        handler.attach(&first).unwrap();
        assert!(matches!(
            handler.attach(&second),
            Err(AttachError::TargetBusy(peer)) if peer == first
        ));
    }
}
