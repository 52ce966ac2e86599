//! the test_utils folder here will share fakes between unit tests of
//! different modules
mod fakes;

pub use fakes::*;
