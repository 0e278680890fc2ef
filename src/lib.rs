pub mod cache;
pub mod config;
pub mod directive;
pub mod engine;
pub mod handlers;
pub mod network;
pub mod protocol;
pub mod server;
pub mod spf;

pub use config::Config;
pub use directive::Directive;
pub use engine::PolicyEngine;
pub use protocol::{PolicyReader, PolicyRequest};
pub use spf::{AuthenticationResolver, IdentityRequest, Scope, SpfCode, SpfResult};
