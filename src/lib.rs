//! Multi-worker JavaScript execution host.
//!
//! `jszone` embeds many isolated JavaScript VMs ("workers") inside one
//! process, groups them into named zones, and dispatches function calls
//! onto them: any-worker execution, per-worker targeting, whole-zone
//! broadcast, and per-task timeouts. The engine itself stays behind the
//! [`engine`] capability traits; the crate is the scheduling core, not an
//! embedding.
//!
//! ```no_run
//! use std::sync::Arc;
//! use jszone::{FunctionSpec, Zone, ZoneSettings};
//! # fn engine_factory() -> Arc<dyn jszone::engine::EngineFactory> { unimplemented!() }
//!
//! let zone = Zone::create(ZoneSettings::new("compute", 4), engine_factory())?;
//! zone.execute(
//!     FunctionSpec::new("math", "add", bytes::Bytes::from_static(b"[1,2]")),
//!     |result| println!("{}", result.code),
//! )?;
//! # Ok::<(), jszone::ZoneError>(())
//! ```

pub mod engine;
pub mod error;
pub mod transport;
pub mod zone;

pub use error::{ResultCode, TaskResult, ZoneError, ZoneResult};
pub use transport::TransportContext;
pub use zone::{
    current_worker, CallContext, CallOptions, FunctionSpec, WorkerContext, WorkerId, Zone,
    ZoneSettings,
};

#[cfg(test)]
pub(crate) mod test_util;
