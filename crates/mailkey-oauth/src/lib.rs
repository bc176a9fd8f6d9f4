//! # mailkey-oauth
//!
//! `OAuth2` bearer-token lifecycle for a single mailbox account.
//!
//! ## Features
//!
//! - **Credential store**: one durable record per account, loaded from and
//!   atomically written back to a single file
//! - **Token broker**: serves cached access tokens while they are valid and
//!   refreshes them against the authorization server otherwise, with at most
//!   one refresh in flight
//! - **Identity check**: exercises refresh token, client id and scope end to end
//! - **SASL**: XOAUTH2 initial responses for IMAP/POP3
//!
//! ## Quick Start
//!
//! ```ignore
//! use mailkey_oauth::{CredentialStore, TokenBroker, TokenPurpose};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = CredentialStore::new("outlook_token.txt");
//!     let record = store.load()?;
//!     CredentialStore::validate(&record)?;
//!
//!     let broker = TokenBroker::new(store, record)?;
//!     let token = broker.get_access_token(TokenPurpose::Graph, false).await?;
//!     // Send: Authorization: Bearer {token}
//!     Ok(())
//! }
//! ```
//!
//! ### Using with IMAP/POP3
//!
//! ```ignore
//! use mailkey_oauth::sasl::xoauth2_response;
//!
//! let token = broker.get_access_token(TokenPurpose::Imap, false).await?;
//! let auth_string = xoauth2_response(broker.account_id(), &token);
//! // Send: AUTHENTICATE XOAUTH2 {auth_string}
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod broker;
mod error;
pub mod provider;
pub mod record;
pub mod sasl;
pub mod store;
pub mod time;
pub mod token;

pub use broker::TokenBroker;
pub use error::{AuthError, AuthResult, ConfigError, ConfigResult};
pub use provider::Provider;
pub use record::{CredentialRecord, RecordFormat};
pub use store::CredentialStore;
pub use token::{IdentityInfo, TokenPurpose};
