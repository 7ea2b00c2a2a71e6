//! A minimal container lifecycle library.
//!
//! A container here is a single host process (the VMM) wrapped in the OCI
//! state machine: `create` parks a re-executed init process on the exec FIFO,
//! `start` releases it, and status is always derived from OS facts.

pub mod bootstrap;
pub mod configs;
pub mod container;
pub mod error;
pub mod factory;
pub mod fifo;
pub mod hooks;
pub mod init;
pub mod logs;
pub mod process;
pub mod specconv;
pub mod state;
pub mod sync;
pub mod system;

pub use configs::Config;
pub use container::{Container, Status};
pub use error::{Error, Result};
pub use factory::Factory;
pub use process::Process;
pub use state::ContainerState;
