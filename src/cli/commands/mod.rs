//! Command handlers, one module per subcommand.

pub mod cancel;
pub mod config;
pub mod init;
pub mod retry;
pub mod run;
pub mod status;
pub mod submit;
pub mod worker;
