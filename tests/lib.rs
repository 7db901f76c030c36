//! Shared fixtures for the cross-crate integration tests

pub mod common;
