pub mod config;
pub mod conversation;

pub use self::config::*;
pub use self::conversation::*;
