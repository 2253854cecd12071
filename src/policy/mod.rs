//! Rule evaluation for sgguard.
//!
//! This module provides the static allow-list matcher ([`allowlist`]) and the
//! adapter to the external policy engine ([`engine`]) used to flag security
//! groups beyond the allow-list.

pub mod allowlist;
pub mod engine;
