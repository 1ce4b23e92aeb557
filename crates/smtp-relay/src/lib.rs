//! Outbound SMTP relay support: a minimal asynchronous SMTP client
//! and a pool of authenticated sessions, so that bulk delivery does
//! not pay the connect/EHLO/AUTH handshake for every message.

pub mod client;
pub mod pool;

pub use client::{ClientError, Response, SmtpClient, SmtpClientTimeouts};
pub use pool::{Pool, PoolConfig, PoolError, SessionConnector, TcpConnector};
