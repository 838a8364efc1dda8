pub mod loopback;
pub mod traits;

pub use loopback::{LoopbackNative, Responder, SentCall};
pub use traits::{InboundPort, NativeBackend};
