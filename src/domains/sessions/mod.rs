pub mod entity;
pub mod monitor;
pub mod process;
pub mod registry;

pub use entity::{Session, SessionLifecycle};
pub use monitor::{ActivityMonitor, Notifier, NullNotifier};
pub use registry::{HookDispatcher, SessionRegistry, SpawnRequest};
