//! Stub Resolver Domain Layer
pub mod config;
pub mod dns_name;
pub mod errors;

pub use config::ResolverConfig;
pub use dns_name::trim_trailing_dot;
pub use errors::ResolveError;
