//! Housing draw engine.
//!
//! A draw moves applicants from self-formed groups, through a lottery that
//! ranks those groups, into a turn-based suite selection. The [`workflows::draw`]
//! module owns the lifecycle state machine and the engines it delegates to.

pub mod config;
pub mod error;
pub mod telemetry;
pub mod workflows;
