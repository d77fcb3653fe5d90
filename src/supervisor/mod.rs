//! osqueryd supervision
//!
//! Each [`Instance`] owns one daemon process and the two background tasks
//! that watch it:
//! - a diagnostic drain forwarding the daemon's stderr into tracing and a
//!   bounded [`LogBuffer`]
//! - a wait task that owns the child, records how it exited and kills its
//!   process group on close
//!
//! Both run under the instance's cancellation token and are joined by
//! [`Instance::close`].
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │                 Instance                  │
//! ├──────────────────────────────────────────┤
//! │  osqueryd   │  drain task  │  wait task  │
//! │  (child)    │  (stderr)    │  (exit)     │
//! ├──────────────────────────────────────────┤
//! │  SocketDetector → Connector → client     │
//! └──────────────────────────────────────────┘
//! ```

pub mod cleanup;
pub mod detect;
pub mod drain;
pub mod instance;
pub mod log_buffer;
pub mod registry;

pub use cleanup::{default_cleaner, NoopCleaner, PrefixCleaner, ResidualCleaner};
pub use detect::SocketDetector;
pub use instance::{Instance, InstanceState, InstanceStatus, ProcessExit};
pub use log_buffer::LogBuffer;
pub use registry::DefaultRegistry;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
