pub mod auth;
pub mod config;
pub mod handler;
pub mod message;
pub mod mime;
pub mod policy;
pub mod query;
pub mod storage;

pub use auth::*;
pub use config::*;
pub use handler::*;
pub use message::*;
pub use mime::*;
pub use policy::*;
pub use query::*;
pub use storage::*;
