//! HTTP middleware layers.

pub mod logging;
