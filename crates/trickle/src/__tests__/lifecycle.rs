//! Enable/disable fan-out, initial sweep scheduling, listener lifecycle,
//! and shutdown.
