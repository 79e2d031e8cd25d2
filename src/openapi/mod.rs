//! Ingestion of Swagger 2.0 API definitions: a typed adapter over the
//! document and a polling client that rebuilds the path index on change.

pub mod client;
pub mod spec;

pub use client::Client;
pub use spec::SpecError;
