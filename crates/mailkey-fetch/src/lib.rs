//! # mailkey-fetch
//!
//! Reads recent messages from an Outlook mailbox using access tokens handed
//! out by a [`mailkey_oauth::TokenBroker`].
//!
//! Three transports are supported behind one [`MessageSource`]:
//!
//! - **Graph**: `GET /me/messages` with a bearer token
//! - **IMAP**: `AUTHENTICATE XOAUTH2` over implicit TLS
//! - **POP3**: `AUTH XOAUTH2` over implicit TLS
//!
//! ```ignore
//! use mailkey_fetch::MessageSource;
//!
//! let source = MessageSource::imap();
//! for summary in source.fetch_recent(&broker, 5).await? {
//!     println!("{summary}");
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod error;
pub mod framed;
pub mod graph;
pub mod imap;
pub mod message;
pub mod pop3;
mod source;

pub use error::{FetchError, Result};
pub use graph::GraphSource;
pub use imap::{ImapSession, ImapSource};
pub use message::MessageSummary;
pub use pop3::{Pop3Session, Pop3Source};
pub use source::MessageSource;
