pub mod pipeline;
pub mod plugin;
pub mod response;

pub use pipeline::Pipeline;
pub use plugin::{Endpoint, Identity, Next, Plugin, PluginContext, UpstreamOutcome};
