pub mod completion;
pub mod errors;
pub mod ids;
pub mod wire;

pub use errors::GatewayError;
pub use ids::CorrelationId;
pub use wire::{InboundKind, InboundMessage, OutboundFrame};
