//! Test modules for the coordinator crate

pub mod stub_worker;
