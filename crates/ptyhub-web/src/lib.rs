//! ptyhub-web — remote access server for a [`libptyhub::SessionPool`].
//!
//! One HTTP listener serves the mobile SPA, a read-only REST projection of
//! the agent list, and a `/ws` endpoint where browser clients subscribe to
//! live agent output. Every data surface is guarded by a bearer token
//! generated at startup.

pub mod assets;
pub mod auth;
pub mod netinfo;
pub mod projection;
pub mod routes;
pub mod server;
pub mod ws;

pub use auth::AuthToken;
pub use netinfo::AdvertisedUrls;
pub use server::{DEFAULT_PORT, RemoteServerConfig, ServerHandle, start};
