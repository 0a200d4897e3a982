#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod block;
pub mod config;
pub mod logging;
pub mod net;

pub use crate::block::{Block, BlockInfo, ColumnData, ColumnString, ColumnUInt64, ColumnUuid};
pub use crate::config::ClientOptions;
pub use crate::net::conn::{Connection, EnqueueResult, PollResult};
pub use crate::net::encode::DEFAULT_QUERY_ID;
pub use crate::net::result::{Error, Result};
