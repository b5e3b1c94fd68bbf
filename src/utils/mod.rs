pub mod command;
pub mod fastq;
pub mod file;
pub mod plotting;
pub mod streams;
pub mod system;
pub mod tables;
