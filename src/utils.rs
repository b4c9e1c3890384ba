//! helpers shared by the image tooling and the filesystem core
pub mod digest;
pub mod geometry_calculator;
pub mod time_util;
pub mod traits;
