//! Speaker device cloud
//!
//! Session lifecycle, the credential record and the typed device service
//! built on top of them.

pub mod account;
pub mod mina;
pub mod session;
pub mod types;

pub use account::{MAX_AUTH_ATTEMPTS, SessionManager};
pub use mina::{MinaService, SERVICE_ID};
pub use session::{ServiceToken, Session, TokenStore};
pub use types::{CloudRequest, Device};
