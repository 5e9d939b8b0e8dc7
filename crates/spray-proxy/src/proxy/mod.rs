//! Request broadcasting: per-backend forwarding and the fan-out dispatcher.

pub mod fanout;
pub mod forward;

pub use fanout::{Dispatch, Dispatcher};
