mod app;
mod delivery;
mod monitor;
mod orchestrator;
mod processor;
mod supervisor;

pub use app::App;
pub use delivery::ReplyDelivery;
pub use monitor::{ComponentStatus, Monitor};
pub use orchestrator::{IntegrationOrchestrator, OrchestratorConfig};
pub use processor::{MessageProcessor, ProcessorConfig};
pub use supervisor::{BridgeSupervisor, WEBHOOK_EVENTS};
