//! Environment helpers shared by the configuration layer.

pub mod env;

pub use env::{get_env_list_with_prefix, get_env_with_prefix};
