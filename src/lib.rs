//! filecast: a line-oriented TCP command server with file transfer
//!
//! Commands:
//! - `ECHO <text>` / `TIME`
//! - `UPLOAD <file>` / `DOWNLOAD <file>`: length-prefixed raw file streaming
//! - `CLOSE` / `EXIT` / `QUIT`
//!
//! Each connection is served by its own task. A shared registry tracks live
//! connections so that shutdown can close all of them at once.

pub mod client;
pub mod command;
pub mod config;
pub mod connection;
pub mod framer;
pub mod registry;
pub mod server;
pub mod transfer;

pub use client::Client;
pub use config::Config;
pub use server::{Server, ShutdownHandle};
