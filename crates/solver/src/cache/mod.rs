//! Cache key model and storage boundary

pub mod key;
pub mod manager;
pub mod storage;

pub use key::*;
pub use manager::*;
pub use storage::*;
