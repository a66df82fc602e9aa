//! # IMAP Connection
//!
//! One authenticated async-imap session over a [`StreamOpener`] stream.
//!
//! ## Session Setup
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  open socket (implicit TLS if the carrier gives an SSL port)            │
//! │      │                                                                  │
//! │      ▼                                                                  │
//! │  S: * OK ...            anything else ─► InvalidGreeting                │
//! │      │                                                                  │
//! │      ▼                                                                  │
//! │  C: CAPABILITY          minus the carrier's disabled capabilities       │
//! │      │                                                                  │
//! │      ├── STARTTLS advertised ─► C: STARTTLS, TLS handshake,             │
//! │      │                          C: CAPABILITY again                     │
//! │      ▼                                                                  │
//! │  AUTH=DIGEST-MD5 advertised ─► C: AUTHENTICATE DIGEST-MD5               │
//! │  otherwise                  ─► C: LOGIN user password                   │
//! │      │                                                                  │
//! │      ├── NO  ─► AuthenticationFailed (event from the status text)       │
//! │      ├── BAD ─► AuthenticationFailed (DataRejectedServerResponse)       │
//! │      ▼                                                                  │
//! │  ready                                                                  │
//! │                                                                         │
//! │  Socket errors or timeouts before "ready" become SessionOpenFailed.     │
//! │  Every later exchange is bounded by the read timeout.                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_imap::error::Error as ImapError;
use async_imap::imap_proto::types::{Capability, Response, Status};
use async_imap::types::{Fetch, Flag as ImapFlag, Quota as ImapQuota};
use async_imap::{Client, Session};
use futures::TryStreamExt;
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use vvm_core::validation::validate_command_argument;
use vvm_core::VvmEvent;

use super::digest::DigestMd5;
use super::folder::{Flag, FolderInfo, FolderMode, INBOX};
use super::stream::{ImapStream, StreamOpener};
use crate::error::{status_text, SyncError, SyncResult};

const CAPABILITY_DIGEST_MD5: &str = "AUTH=DIGEST-MD5";
const CAPABILITY_STARTTLS: &str = "STARTTLS";

/// Where and how to open a session.
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub implicit_tls: bool,
    pub username: String,
    pub password: String,
    pub disabled_capabilities: Vec<String>,
    pub read_timeout: Duration,
}

/// An open, authenticated IMAP session.
pub struct ImapConnection {
    session: Session<Box<dyn ImapStream>>,
    capabilities: HashSet<String>,
    read_timeout: Duration,
}

/// A client that has not authenticated yet.
struct Handshake {
    client: Client<Box<dyn ImapStream>>,
    capabilities: HashSet<String>,
    disabled: Vec<String>,
    read_timeout: Duration,
}

impl ImapConnection {
    /// Opens a socket, negotiates TLS and authenticates.
    pub async fn open(
        opener: &dyn StreamOpener,
        settings: &ConnectionSettings,
    ) -> SyncResult<Self> {
        let stream = opener
            .open(&settings.host, settings.port, settings.implicit_tls)
            .await?;

        let handshake = Handshake {
            client: Client::new(stream),
            capabilities: HashSet::new(),
            disabled: settings
                .disabled_capabilities
                .iter()
                .map(|c| c.to_ascii_uppercase())
                .collect(),
            read_timeout: settings.read_timeout,
        };

        handshake
            .run(opener, settings)
            .await
            .map_err(|e| match e {
                SyncError::Io(msg) => SyncError::SessionOpenFailed(msg),
                SyncError::Timeout(secs) => {
                    SyncError::SessionOpenFailed(format!("no response within {}s", secs))
                }
                other => other,
            })
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(&capability.to_ascii_uppercase())
    }

    // =========================================================================
    // Folder
    // =========================================================================

    /// SELECT or EXAMINE the inbox.
    pub async fn open_inbox(&mut self, mode: FolderMode) -> SyncResult<FolderInfo> {
        let limit = self.read_timeout;
        let session = &mut self.session;
        let mailbox = match mode {
            FolderMode::ReadWrite => within(limit, session.select(INBOX)).await,
            FolderMode::ReadOnly => within(limit, session.examine(INBOX)).await,
        }
        .map_err(|e| named(e, "SELECT"))?;

        Ok(FolderInfo {
            mode,
            message_count: i64::from(mailbox.exists),
        })
    }

    pub async fn uid_search(&mut self, criteria: &str) -> SyncResult<HashSet<u32>> {
        let limit = self.read_timeout;
        within(limit, self.session.uid_search(criteria))
            .await
            .map_err(|e| named(e, "UID SEARCH"))
    }

    /// Runs a UID FETCH and collects every response.
    pub async fn uid_fetch(&mut self, uids: &str, query: &str) -> SyncResult<Vec<Fetch>> {
        let limit = self.read_timeout;
        let session = &mut self.session;
        within(limit, async move {
            let responses = session.uid_fetch(uids, query).await?;
            let fetches: Vec<Fetch> = responses.try_collect().await?;
            Ok::<_, ImapError>(fetches)
        })
        .await
        .map_err(|e| named(e, "UID FETCH"))
    }

    pub async fn uid_store(&mut self, uids: &str, query: &str) -> SyncResult<()> {
        let limit = self.read_timeout;
        let session = &mut self.session;
        within(limit, async move {
            let responses = session.uid_store(uids, query).await?;
            let _: Vec<Fetch> = responses.try_collect().await?;
            Ok::<_, ImapError>(())
        })
        .await
        .map_err(|e| named(e, "UID STORE"))
    }

    pub async fn expunge(&mut self) -> SyncResult<()> {
        let limit = self.read_timeout;
        let session = &mut self.session;
        within(limit, async move {
            let expunged = session.expunge().await?;
            let removed: Vec<u32> = expunged.try_collect().await?;
            debug!(count = removed.len(), "Expunged");
            Ok::<_, ImapError>(())
        })
        .await
        .map_err(|e| named(e, "EXPUNGE"))
    }

    /// GETQUOTAROOT on the inbox.
    pub async fn quota(&mut self) -> SyncResult<Vec<ImapQuota>> {
        let limit = self.read_timeout;
        let (_, quotas) = within(limit, self.session.get_quota_root(INBOX))
            .await
            .map_err(|e| named(e, "GETQUOTAROOT"))?;
        Ok(quotas)
    }

    /// Sends a carrier command verbatim and waits for its tagged OK.
    ///
    /// The command text is never logged; carrier commands carry PINs.
    pub async fn run_raw(&mut self, command: &str) -> SyncResult<()> {
        debug!(command = %command_name(command), "IMAP >> [redacted]");
        let limit = self.read_timeout;
        within(limit, self.session.run_command_and_check_ok(command))
            .await
            .map_err(|e| named(e, command_name(command)))
    }

    /// Logs out. Failures are only logged.
    pub async fn close(mut self) {
        match within(self.read_timeout, self.session.logout()).await {
            Ok(()) => debug!("Logged out"),
            Err(e) => warn!(?e, "Error while logging out"),
        }
    }
}

// =============================================================================
// Handshake
// =============================================================================

impl Handshake {
    async fn run(
        mut self,
        opener: &dyn StreamOpener,
        settings: &ConnectionSettings,
    ) -> SyncResult<ImapConnection> {
        self.read_greeting().await?;
        self.query_capabilities().await?;

        if !settings.implicit_tls && self.has(CAPABILITY_STARTTLS) {
            within(
                self.read_timeout,
                self.client.run_command_and_check_ok(CAPABILITY_STARTTLS, None),
            )
            .await?;

            let plain = self.client.into_inner();
            let secured = opener.start_tls(plain, &settings.host).await?;
            self.client = Client::new(secured);
            self.query_capabilities().await?;
        }

        let capabilities = self.capabilities.clone();
        let read_timeout = self.read_timeout;
        let session = self.authenticate(settings).await?;

        Ok(ImapConnection {
            session,
            capabilities,
            read_timeout,
        })
    }

    fn has(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    async fn read_greeting(&mut self) -> SyncResult<()> {
        let read = within(self.read_timeout, async {
            Ok::<_, SyncError>(self.client.read_response().await)
        })
        .await?;

        let Some(greeting) = read.into_response()? else {
            return Err(SyncError::Io("connection closed before greeting".into()));
        };

        match greeting.parsed() {
            Response::Data {
                status: Status::Ok,
                ..
            } => Ok(()),
            other => Err(SyncError::InvalidGreeting(format!("{:?}", other))),
        }
    }

    /// CAPABILITY, keeping everything the carrier has not disabled.
    async fn query_capabilities(&mut self) -> SyncResult<()> {
        let request = within(self.read_timeout, self.client.run_command("CAPABILITY")).await?;

        let mut capabilities = HashSet::new();
        loop {
            let read = within(self.read_timeout, async {
                Ok::<_, SyncError>(self.client.read_response().await)
            })
            .await?;
            let Some(data) = read.into_response()? else {
                return Err(SyncError::Io("connection closed during CAPABILITY".into()));
            };

            match data.parsed() {
                Response::Capabilities(list) => {
                    capabilities.extend(list.iter().map(capability_name));
                }
                Response::Done {
                    tag,
                    status,
                    information,
                    ..
                } if *tag == request => {
                    if *status != Status::Ok {
                        return Err(SyncError::CommandRejected {
                            command: "CAPABILITY".into(),
                            status: format!("{:?}", status).to_ascii_uppercase(),
                            code: None,
                            text: information.as_deref().unwrap_or_default().to_string(),
                        });
                    }
                    break;
                }
                _ => {}
            }
        }

        capabilities.retain(|c: &String| !self.disabled.contains(c));
        debug!(capabilities = ?capabilities, "Server capabilities");
        self.capabilities = capabilities;
        Ok(())
    }

    async fn authenticate(
        self,
        settings: &ConnectionSettings,
    ) -> SyncResult<Session<Box<dyn ImapStream>>> {
        for (field, value) in [
            ("username", settings.username.as_str()),
            ("password", settings.password.as_str()),
        ] {
            if let Err(e) = validate_command_argument(field, value) {
                return Err(SyncError::AuthenticationFailed {
                    event: VvmEvent::DataBadImapCredential,
                    message: e.to_string(),
                });
            }
        }

        let limit = self.read_timeout;
        let attempt = if self.has(CAPABILITY_DIGEST_MD5) {
            debug!(username = %settings.username, "Authenticating with DIGEST-MD5");
            let digest = DigestMd5::new(&settings.username, &settings.password, &settings.host);
            tokio::time::timeout(limit, self.client.authenticate("DIGEST-MD5", digest)).await
        } else {
            tokio::time::timeout(
                limit,
                self.client.login(&settings.username, &settings.password),
            )
            .await
        };

        match attempt {
            Err(_) => Err(SyncError::Timeout(limit.as_secs())),
            Ok(Ok(session)) => {
                debug!(username = %settings.username, "Logged in");
                Ok(session)
            }
            Ok(Err((ImapError::No(text), _client))) => {
                let text = status_text(&text);
                let event = VvmEvent::from_login_rejection(&text);
                warn!(status = "NO", event = %event, "Login rejected");
                Err(SyncError::AuthenticationFailed {
                    event,
                    message: text,
                })
            }
            Ok(Err((ImapError::Bad(text), _client))) => {
                warn!(status = "BAD", "Login rejected");
                Err(SyncError::AuthenticationFailed {
                    event: VvmEvent::DataRejectedServerResponse,
                    message: status_text(&text),
                })
            }
            Ok(Err((other, _client))) => Err(other.into()),
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// async-imap versions disagree on how a single response read reports end
/// of stream; both shapes end up as `Option` of a response here.
trait ReadOutcome<T> {
    fn into_response(self) -> SyncResult<Option<T>>;
}

impl<T, E: Into<SyncError>> ReadOutcome<T> for Option<Result<T, E>> {
    fn into_response(self) -> SyncResult<Option<T>> {
        self.transpose().map_err(Into::into)
    }
}

impl<T, E: Into<SyncError>> ReadOutcome<T> for Result<Option<T>, E> {
    fn into_response(self) -> SyncResult<Option<T>> {
        self.map_err(Into::into)
    }
}

async fn within<T, E>(
    limit: Duration,
    exchange: impl Future<Output = Result<T, E>>,
) -> SyncResult<T>
where
    E: Into<SyncError>,
{
    tokio::time::timeout(limit, exchange)
        .await
        .map_err(|_| SyncError::Timeout(limit.as_secs()))?
        .map_err(Into::into)
}

/// Names the command in a tagged rejection.
fn named(error: SyncError, command: &str) -> SyncError {
    match error {
        SyncError::CommandRejected {
            status, code, text, ..
        } => SyncError::CommandRejected {
            command: command.to_string(),
            status,
            code,
            text,
        },
        other => other,
    }
}

fn capability_name(capability: &Capability<'_>) -> String {
    match capability {
        Capability::Imap4rev1 => "IMAP4REV1".to_string(),
        Capability::Auth(mechanism) => format!("AUTH={}", mechanism.to_ascii_uppercase()),
        Capability::Atom(atom) => atom.to_ascii_uppercase(),
    }
}

/// Verb of a command line, safe to log. `XCHANGE_TUI_PWD PWD=1` gives
/// `XCHANGE_TUI_PWD`.
fn command_name(command: &str) -> &str {
    command.split(' ').next().unwrap_or_default()
}

/// Whether a fetched message carries `flag`.
pub fn has_flag(fetch: &Fetch, flag: Flag) -> bool {
    fetch.flags().any(|f| match flag {
        Flag::Seen => matches!(f, ImapFlag::Seen),
        Flag::Deleted => matches!(f, ImapFlag::Deleted),
    })
}
