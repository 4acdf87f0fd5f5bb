/*!
    The fixed processing chain between the source slot and the output.

    Built once at startup and never touched again. The swap protocol only
    needs two of its pads: the first stage's input (the checkpoint) and the
    first stage's output (where drain completion is observed).
*/

use tracing::debug;

use crate::config::{SinkConfig, SinkKind};
use crate::engine::{self, Engine, EngineExt, NodeId, PadRef, PropValue};
use crate::error::EngineError;

/**
    One stage: a factory, a node name and its properties.
*/
#[derive(Clone, Debug, PartialEq)]
pub struct StageSpec {
    pub factory: String,
    pub name: String,
    pub properties: Vec<(String, PropValue)>,
}

impl StageSpec {
    pub fn new(factory: &str, name: &str) -> Self {
        Self {
            factory: factory.to_string(),
            name: name.to_string(),
            properties: Vec::new(),
        }
    }

    pub fn property(mut self, key: &str, value: impl Into<PropValue>) -> Self {
        self.properties.push((key.to_string(), value.into()));
        self
    }
}

/// `depay ! decoder ! convert ! encoder ! <sink>`.
pub fn default_stages(sink: &SinkConfig) -> Vec<StageSpec> {
    let mut stages = vec![
        StageSpec::new("rtph264depay", "depay"),
        StageSpec::new("avdec_h264", "decoder"),
        StageSpec::new("videoconvert", "video_convert"),
        StageSpec::new("x264enc", "encoder").property("tune", "zerolatency"),
    ];
    stages.extend(sink_stages(sink));
    stages
}

fn sink_stages(sink: &SinkConfig) -> Vec<StageSpec> {
    match sink.kind {
        SinkKind::Rtsp => vec![
            StageSpec::new("rtspclientsink", "sink").property("location", sink.location.as_str()),
        ],
        SinkKind::Udp => vec![
            StageSpec::new("mpegtsmux", "mux"),
            StageSpec::new("udpsink", "sink")
                .property("host", sink.host.as_str())
                .property("port", sink.port),
        ],
    }
}

/**
    Stages added to the graph and linked in order.
*/
#[derive(Clone, Debug)]
pub struct StageChain {
    stages: Vec<(String, NodeId)>,
}

impl StageChain {
    /**
        Create every stage and link neighbours. Nothing is rolled back on
        failure; the caller drops the whole pipeline.
    */
    pub fn build(engine: &dyn Engine, specs: &[StageSpec]) -> engine::Result<Self> {
        let mut stages: Vec<(String, NodeId)> = Vec::with_capacity(specs.len());
        for spec in specs {
            let node = engine.add_node(&spec.factory, &spec.name, &spec.properties)?;
            if let Some((_, previous)) = stages.last() {
                engine.link_nodes(*previous, node)?;
            }
            debug!(factory = %spec.factory, name = %spec.name, "stage added");
            stages.push((spec.name.clone(), node));
        }
        if stages.is_empty() {
            return Err(EngineError::Unavailable("stage chain is empty".to_string()));
        }
        Ok(Self { stages })
    }

    pub fn first(&self) -> NodeId {
        self.stages[0].1
    }

    pub fn last(&self) -> NodeId {
        self.stages[self.stages.len() - 1].1
    }

    pub fn node(&self, name: &str) -> Option<NodeId> {
        self.stages.iter().find(|(n, _)| n == name).map(|(_, id)| *id)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Input of the first stage, where sources are linked and swaps are triggered.
    pub fn checkpoint(&self, engine: &dyn Engine) -> engine::Result<PadRef> {
        engine.static_pad(self.first(), "sink")
    }

    /// Output of the first stage, where a drained marker shows up.
    pub fn drain_point(&self, engine: &dyn Engine) -> engine::Result<PadRef> {
        engine.static_pad(self.first(), "src")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sim::SimEngine;
    use crate::error::LinkFailure;

    #[test]
    fn rtsp_chain_matches_stock_pipeline() {
        let stages = default_stages(&SinkConfig::default());
        let factories: Vec<_> = stages.iter().map(|s| s.factory.as_str()).collect();
        assert_eq!(
            factories,
            ["rtph264depay", "avdec_h264", "videoconvert", "x264enc", "rtspclientsink"]
        );
        assert_eq!(
            stages[4].properties,
            vec![("location".to_string(), PropValue::from("rtsp://127.0.0.1:8555/live"))]
        );
    }

    #[test]
    fn udp_chain_muxes_before_sending() {
        let sink = SinkConfig {
            kind: SinkKind::Udp,
            ..SinkConfig::default()
        };
        let stages = default_stages(&sink);
        let tail: Vec<_> = stages.iter().rev().take(2).map(|s| s.factory.as_str()).collect();
        assert_eq!(tail, ["udpsink", "mpegtsmux"]);
        assert!(stages
            .last()
            .unwrap()
            .properties
            .contains(&("port".to_string(), PropValue::UInt(1234))));
    }

    #[test]
    fn builds_and_links_on_sim() {
        let engine = SimEngine::new();
        let chain = StageChain::build(&engine, &default_stages(&SinkConfig::default())).unwrap();
        assert_eq!(chain.len(), 5);
        assert_eq!(chain.node("depay"), Some(chain.first()));

        let checkpoint = chain.checkpoint(&engine).unwrap();
        assert!(engine.peer(&checkpoint).is_none());
        let drain = chain.drain_point(&engine).unwrap();
        let decoder_sink = engine.static_pad(chain.node("decoder").unwrap(), "sink").unwrap();
        assert_eq!(engine.peer(&drain), Some(decoder_sink));
    }

    #[test]
    fn mismatched_stages_fail_to_link() {
        let engine = SimEngine::new();
        let specs = [
            StageSpec::new("avdec_h264", "decoder"),
            StageSpec::new("rtph264depay", "depay"),
        ];
        let err = StageChain::build(&engine, &specs).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Link {
                reason: LinkFailure::Incompatible { .. },
                ..
            }
        ));
    }

    #[test]
    fn unknown_property_is_a_build_error() {
        let engine = SimEngine::new();
        let specs = [StageSpec::new("x264enc", "encoder").property("colour", "blue")];
        assert!(matches!(
            StageChain::build(&engine, &specs),
            Err(EngineError::Property { .. })
        ));
    }
}
