//! Common test utilities and fixtures for hypervisor tests
//!
//! This module provides reusable test infrastructure to reduce boilerplate
//! and keep the integration and unit suites readable.

#![allow(dead_code)]

pub mod fixtures;
pub mod helpers;

pub use fixtures::TestFixtures;
pub use helpers::{GatedBackend, HypervisorBuilder, TestHelpers, TestStation};
