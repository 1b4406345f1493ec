//! Test utilities for Raffel adapters.

mod app;

pub use app::{TestApp, TestResponse};
