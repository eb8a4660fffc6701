//! Block and transaction subscribers with handler fan-out (C7, C8).

pub mod block;
pub mod handler;
pub mod tx;

pub use block::{BlockSubscriber, BlockSubscriberConfig, BlockSubscriberStats};
pub use handler::{BlockEventHandler, HandlerRegistry, TxEventHandler};
pub use tx::{TxSubscriberConfig, TxSubscriberMode, TxSubscriberStats, TxSubscriber};
