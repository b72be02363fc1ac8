pub mod remote;

pub use remote::{EventSink, OutboundEvent, RemoteControl};
