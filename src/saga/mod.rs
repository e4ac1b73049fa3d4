pub mod file_log;
pub mod log;
pub mod message;
#[allow(clippy::module_inception)]
pub mod saga;

pub use file_log::FileSagaLog;
pub use log::{InMemorySagaLog, SagaLog};
pub use message::{JobId, MessageKind, SagaMessage};
pub use saga::Saga;
