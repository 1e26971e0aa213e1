//! Thread registry and stop-the-world coordination for conservative tracing
//! garbage collectors.
//!
//! A [`Threads`] registry knows every thread that may hold references into
//! the managed heap. The collector suspends them with
//! [`Threads::suspend_all`], enumerates their stacks, register spills,
//! pending thread starts and auxiliary per-thread data through
//! [`SuspendedWorld::scan_all_type`], and resumes them by dropping the guard.
//!
//! ```no_run
//! use std::sync::Arc;
//! use gc_threads::{Threads, ThreadsConfig};
//!
//! let threads = Arc::new(Threads::native(ThreadsConfig::from_env()));
//! let worker = threads.spawn(|| { /* mutator */ }).unwrap();
//!
//! let world = threads.suspend_all().unwrap();
//! world.scan_all_type(&mut |_kind, _start, _end| { /* mark conservatively */ });
//! drop(world);
//!
//! worker.join().unwrap();
//! ```

pub mod base;
pub mod config;
pub mod context;
pub mod error;
pub mod platform;
pub mod scan;
pub mod suspend;
pub mod thread;
pub mod threads;
pub mod tls;

pub use config::ThreadsConfig;
pub use context::{ContextState, StackContext};
pub use error::{Error, Result};
pub use platform::{NativePlatform, Platform};
pub use scan::RootKind;
pub use suspend::SuspendedWorld;
pub use thread::ThreadHandle;
pub use threads::Threads;
pub use tls::{NoTlsGc, TlsGc, TlsToken};
