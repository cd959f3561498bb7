//! Connection lifecycle, sessions and the session registry.
//!
//! A [`Lifecycle`] is the single source of truth for whether a connection may
//! execute a given method. A [`Session`] binds one lifecycle to an opaque id;
//! the [`SessionRegistry`] owns every live session of an HTTP server and
//! expires idle ones. [`InFlightTracker`] follows requests currently inside a
//! handler so shutdown can drain them.

pub mod drain;
pub mod lifecycle;
pub mod registry;
pub mod session;

pub use drain::{InFlightGuard, InFlightTracker};
pub use lifecycle::{ConnectionState, Lifecycle, PeerInfo};
pub use registry::{SessionRegistry, SweeperHandle};
pub use session::Session;
