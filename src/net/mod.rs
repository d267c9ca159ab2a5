pub mod memory;
pub mod protocol;
pub mod transport;
