pub mod config;
pub mod error;
pub mod http;
pub mod registry;
pub mod utils;

#[cfg(test)]
pub mod test_utils;
