//! The networking modules in `magnetar` implement the non-blocking ClickHouse
//! native-protocol pipeline: one socket, one receive ring and one FIFO of
//! pre-encoded INSERT requests per connection.

pub mod conn;
pub mod encode;
pub mod parse;
pub mod protocol;
pub mod result;
pub mod ring;
pub mod socket;
pub mod wire;
