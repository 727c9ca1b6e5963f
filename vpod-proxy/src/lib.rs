//! Proxy and shim process adapters.
//!
//! The proxy owns the single channel into the VM and brokers shim
//! sessions onto it; shims are the per-container host processes the
//! outer runtime watches. Both are external binaries with small,
//! stable flag contracts.

pub mod cc;
pub mod noop;
pub mod shim;

pub use cc::CcProxy;
pub use noop::NoopProxy;
pub use shim::{ShimManager, ShimParams};
