//! lanshare: find devices on the local network and send them files.
//!
//! Devices announce themselves with UDP broadcasts and transfer files over
//! one TCP connection per file, with pause, resume, cancel, resumption of
//! interrupted transfers and a SHA-256 check of every received file.
//!
//! The [`net`] module holds the engine; [`app`] wires it into a running
//! node and [`config`] describes how that node is set up.

pub mod app;
pub mod config;
pub mod net;

pub use app::AppState;
pub use config::Config;
