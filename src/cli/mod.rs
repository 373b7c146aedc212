//! CLI Module
//!
//! Exit codes for automation around the `labconsole` binary.

pub mod exit_codes;

pub use exit_codes::{exit_code_description, exit_code_for, print_exit_codes, CliResult, ExitCodes};
