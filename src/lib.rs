pub mod cli_interface;
pub mod error;
mod fs;
pub mod mkfs;
pub mod mount;
pub mod nand;
pub mod utils;
pub use error::{FlashError, Result};
pub use fs::*;
