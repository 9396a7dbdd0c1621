pub mod assembler;
pub mod cli;
pub mod completion;
pub mod config;
pub mod device;
pub mod error;
pub mod frida_device;
pub mod resolver;
pub mod retrieval;
pub mod router;
pub mod signals;
pub mod ssh;
pub mod staging;
pub mod workflow;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{DumperError, Result};
pub use frida_device::run_with_frida;
pub use workflow::run_dump_workflow;
