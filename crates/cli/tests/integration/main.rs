//! CLI integration tests: real builds against isolated bramble roots.

mod common;

#[cfg(unix)]
mod build_tests;
#[cfg(unix)]
mod cache_tests;
