//! End-to-end install tests against a temporary prefix.

mod common;

mod concurrency_tests;
mod digest_tests;
mod install_tests;
