//! Raffi HTTP surface.
//!
//! Routes session CRUD, playlist and segment delivery (with seek rewriting
//! and cast-token URL rewriting), audio switching, clip export, torrent
//! byte-range serving, the cast-token gate, and the community-addon proxy.

pub mod cast;
pub mod handlers;
pub mod range;
pub mod server;

pub use cast::CastGate;
pub use server::{AppState, build_router, run_server};
