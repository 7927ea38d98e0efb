//! Network primitives.

mod addr;
pub use self::addr::ListenAddress;

pub mod listener;
pub use self::listener::ConnectionOrientedListener;

pub mod server;

mod stream;
pub use self::stream::{Connection, PeerAddress};

#[cfg(unix)]
mod unix;

pub mod util;
