//! # Lettuce ZMTP
//!
//! ZMTP 3.0 ROUTER/DEALER sockets on `compio`, NULL mechanism only.
//!
//! - `codec`: frame encoding and incremental decoding
//! - `greeting`, `command`, `handshake`: connection setup, including the
//!   READY `Identity` property that routers address peers by
//! - `RouterSocket`: bind, accept, identity-routed send and receive
//! - `DealerSocket`: connect (with redial) or bind, round-robin send
//!
//! Sockets are single-threaded: create and drive them inside one compio
//! runtime.
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use lettuce_core::options::EndpointOptions;
//! use lettuce_zmtp::{DealerSocket, RouterSocket};
//! use std::time::Duration;
//!
//! #[compio::main]
//! async fn main() -> std::io::Result<()> {
//!     let mut router = RouterSocket::bind("127.0.0.1:0".parse().unwrap(), EndpointOptions::default()).await?;
//!     let mut dealer = DealerSocket::connect(
//!         router.local_addr(),
//!         Some(Bytes::from_static(b"alice")),
//!         EndpointOptions::default(),
//!     )
//!     .await?;
//!
//!     dealer.send(&[Bytes::new(), Bytes::from_static(b"hi")], Duration::from_secs(1)).await?;
//!     let msg = router.recv().await?;
//!     assert_eq!(&msg[0][..], b"alice");
//!     Ok(())
//! }
//! ```

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod codec;
pub mod command;
pub mod dealer;
pub mod greeting;
pub mod handshake;
mod pipe;
pub mod router;

pub use codec::{ZmtpError, ZmtpFrame};
pub use command::SocketType;
pub use dealer::DealerSocket;
pub use router::{RouterEvent, RouterSocket};
