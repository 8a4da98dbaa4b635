//! Request handlers, grouped by surface.

pub mod addons;
pub mod clip;
pub mod sessions;
pub mod stream;
pub mod torrents;
