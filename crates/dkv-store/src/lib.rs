//! Replicated store facade for dkv.
//!
//! Glues the pieces together: the [`KvFsm`] drives committed commands into
//! a [`dkv_kv::Storer`], and the [`Store`] facade owns the consensus
//! engine, the peer stream layer, and the shutdown signal. The
//! [`reconcile`] module converges cluster membership to the operator's
//! configured peer set.

mod error;
mod fsm;
pub mod reconcile;
mod shutdown;
mod store;

pub use error::{StoreError, StoreResult};
pub use fsm::KvFsm;
pub use shutdown::Shutdown;
pub use store::{APPLY_TIMEOUT, RETAIN_SNAPSHOT_COUNT, Store};
