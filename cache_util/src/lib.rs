pub mod id;
pub mod logging;
pub mod shutdown;

pub use id::{FileHandleId, RequestId};
pub use shutdown::ShutdownGuard;
