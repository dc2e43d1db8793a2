//! Glue for the Arktos binaries: the command line of the scheduler and the file based pod
//! source that feeds it.

pub mod manifest;
pub mod opts;
