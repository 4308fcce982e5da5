//! mrgc-core — shared foundations for the multi-region GPU cluster control plane.
//!
//! - **`config`** — `ControlPlaneConfig`, loaded from TOML with `MRGC_*`
//!   environment overrides and validated before anything starts.
//! - **`clock`** — the `Clock` trait every control loop measures elapsed
//!   time with, plus a manual clock for tests.
//! - **`secure`** — the opaque encrypt/decrypt boundary implemented by the
//!   secure-compute path. The control plane never inspects plaintext or keys.

pub mod clock;
pub mod config;
pub mod secure;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ConfigError, ControlPlaneConfig, PoolConfig, RegionLatency};
pub use secure::{Attestation, Ciphertext, KeyRef, SecureCompute, SecureComputeError};
