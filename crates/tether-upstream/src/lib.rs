pub mod config;
pub mod gateway;
pub mod registry;
pub mod router;
pub mod supervisor;
pub mod translator;
pub mod waiter;

pub use config::UpstreamConfig;
pub use gateway::CompletionGateway;
pub use registry::{Delivery, PendingRequest, RegistrationGuard, RequestMode, RequestRegistry};
pub use router::MessageRouter;
pub use supervisor::{ConnectionState, ConnectionSupervisor};
pub use translator::{StreamEvent, StreamTranslator};
pub use waiter::ResponseWaiter;
