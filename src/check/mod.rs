//! Check sessions and check-interval locks

pub mod lock;
pub mod session;

pub use lock::{InProcessLocks, Lock, LockFactory, LockGuard, LockId};
pub use session::{CheckSession, CheckSessionFactory, ContainerExpiries};
