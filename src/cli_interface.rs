//! command line interface of the `flashfs` tool
mod cli_struct;
pub use cli_struct::*;
