//! Process utilities shared by the binaries.

pub mod bootstrap;
