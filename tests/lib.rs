//! Shared helpers for the headlink integration tests.
