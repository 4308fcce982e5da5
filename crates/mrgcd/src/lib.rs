//! mrgcd — one region's multi-region GPU control plane.
//!
//! The binary in `main.rs` parses the command line and hands off to
//! [`control_plane::run`]. The library half exists so integration tests
//! can assemble a [`ControlPlane`](control_plane::ControlPlane) without
//! binding a socket.

pub mod control_plane;

pub use control_plane::{ControlPlane, purge_loop, run};
