//! The request-processing chain: access logging, path rewriting, CORS,
//! OAuth2 authorization, and the reverse proxy. Chained so that the log sees
//! the final status and the authorizer sees the rewritten path.

pub mod cors;
pub mod logging;
pub mod oauth2;
pub mod path;
pub mod proxy;
