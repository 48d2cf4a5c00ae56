pub mod router;
pub mod traits;

pub use router::{ChannelRouter, Outbound};
pub use traits::{Channel, InboundEvent, InboundMessage};
