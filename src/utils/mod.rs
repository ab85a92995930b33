pub mod ccs;
pub mod cluster;
pub mod command;
pub mod fastq;
pub mod fastx;
pub mod file;
pub mod logs;
pub mod stats;
pub mod system;

#[cfg(feature = "bash5")]
pub mod bash5;
