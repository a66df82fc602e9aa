//! # IMAP Access
//!
//! The data channel of an OMTP voicemail box.
//!
//! ## Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   transport   ImapTransport: one account, one sync pass                 │
//! │       │                                                                 │
//! │   folder      inbox queries, BODYSTRUCTURE and header interpretation    │
//! │       │                                                                 │
//! │   connection  async-imap session: STARTTLS, LOGIN or DIGEST-MD5         │
//! │       │                                                                 │
//! │   digest      SASL DIGEST-MD5 authenticator                             │
//! │       │                                                                 │
//! │   stream      TCP / TLS sockets behind StreamOpener                     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod connection;
pub mod digest;
pub mod folder;
pub mod stream;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{ConnectionSettings, ImapConnection};
pub use folder::{BodyPart, Flag, FolderInfo, FolderMode, RemoteMessage, StructureOutcome};
pub use stream::{ImapStream, StreamOpener, TcpOpener};
pub use transport::ImapTransport;
