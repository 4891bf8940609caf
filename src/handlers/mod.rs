pub mod config;
pub mod records;

pub use self::config::*;
pub use self::records::*;
