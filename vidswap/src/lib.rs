/*!
    Live source hot-swap for a transcode/relay pipeline.

    A fixed stage chain keeps running while the upstream source feeding it
    is replaced: flow is held at the chain's input, the first stage is
    drained with an end-of-stream marker, the old source is removed and the
    replacement is linked in once it announces output.
*/

pub mod attach;
pub mod chain;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod relay;
pub mod state;
pub mod trigger;

pub use config::RelayConfig;
pub use coordinator::Coordinator;
pub use relay::Relay;
pub use state::{SwapPhase, SwapSnapshot};
