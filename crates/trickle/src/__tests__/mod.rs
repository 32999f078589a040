//! End-to-end tests for the scheduler actor.

mod helpers;

mod adaptive;
mod driving;
mod lifecycle;
mod recovery;
