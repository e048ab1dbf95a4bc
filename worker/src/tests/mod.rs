//! Test modules for the worker crate

mod api_tests;
mod stream_tests;
