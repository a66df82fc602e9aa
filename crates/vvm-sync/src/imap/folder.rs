//! # Inbox Commands
//!
//! Command arguments and response interpreters for the voicemail inbox.
//! Nothing here touches the socket; [`ImapTransport`](super::ImapTransport)
//! runs the commands through async-imap and feeds the parsed responses back
//! in.
//!
//! ## Commands Used
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  open      SELECT "INBOX" / EXAMINE "INBOX"                             │
//! │  list      UID SEARCH 1:* NOT DELETED                                   │
//! │  find      UID SEARCH UID 42                                            │
//! │  structure UID FETCH 42 (UID FLAGS INTERNALDATE BODYSTRUCTURE           │
//! │                 BODY.PEEK[HEADER.FIELDS (DATE FROM CONTENT-DURATION)])  │
//! │  part      UID FETCH 42 (UID BODY.PEEK[1])                              │
//! │  flags     UID STORE 42,43 +FLAGS.SILENT (\Seen)                        │
//! │  quota     GETQUOTAROOT "INBOX"  →  * QUOTA "" (voice 3 40)             │
//! │  close     EXPUNGE                                                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_imap::imap_proto::types::{BodyStructure, ContentEncoding, SectionPath};
use async_imap::types::{Quota as ImapQuota, QuotaResourceName};
use base64::Engine;
use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use std::fmt;
use tracing::{debug, warn};

use vvm_core::Quota;

use crate::error::{SyncError, SyncResult};

pub use vvm_core::INBOX;

/// Query of the structure fetch.
pub const STRUCTURE_QUERY: &str =
    "(UID FLAGS INTERNALDATE BODYSTRUCTURE BODY.PEEK[HEADER.FIELDS (DATE FROM CONTENT-DURATION)])";

/// Search criteria of the full listing.
pub const SEARCH_ALL: &str = "1:* NOT DELETED";

/// Quota resource name carriers use for voicemail.
const QUOTA_RESOURCE_VOICE: &str = "voice";

// =============================================================================
// Types
// =============================================================================

/// How the inbox is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderMode {
    ReadOnly,
    ReadWrite,
}

/// Result of opening the inbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FolderInfo {
    pub mode: FolderMode,
    pub message_count: i64,
}

/// Message flags the engine reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Seen,
    Deleted,
}

impl Flag {
    pub fn as_imap(&self) -> &'static str {
        match self {
            Flag::Seen => "\\Seen",
            Flag::Deleted => "\\Deleted",
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_imap())
    }
}

/// One leaf of a BODYSTRUCTURE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyPart {
    /// Section number used in `BODY[...]`.
    pub part_id: String,

    /// Lower-cased `type/subtype`.
    pub mime_type: String,

    /// Lower-cased content transfer encoding.
    pub encoding: String,

    pub size: i64,
}

impl BodyPart {
    /// The section this part is fetched as, `1.2` → `[1, 2]`.
    pub fn section(&self) -> SyncResult<SectionPath> {
        self.part_id
            .split('.')
            .map(|n| n.parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map(|path| SectionPath::Part(path, None))
            .map_err(|_| SyncError::InvalidMessage(format!("bad part id {}", self.part_id)))
    }
}

/// Transient projection of one remote voicemail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    pub uid: String,
    pub seen: bool,
    pub deleted: bool,
    pub timestamp: DateTime<Utc>,
    pub number: Option<String>,
    pub duration: Option<i64>,
    pub audio: BodyPart,
    pub transcription: Option<BodyPart>,
}

/// How a structure fetch turned out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructureOutcome {
    /// A multipart message with an audio part.
    Voicemail(RemoteMessage),

    /// Fetched, but not a voicemail. Skipped silently.
    NotVoicemail(String),

    /// The server sent no data for the UID.
    Missing,
}

/// What one structure FETCH returned for a UID.
#[derive(Debug, Default)]
pub struct FetchedStructure<'a> {
    pub seen: bool,
    pub deleted: bool,
    pub structure: Option<&'a BodyStructure<'a>>,
    pub header: Option<&'a [u8]>,
    pub internal_date: Option<DateTime<Utc>>,
}

// =============================================================================
// Search
// =============================================================================

pub fn search_uid_criteria(uid: &str) -> String {
    format!("UID {}", uid)
}

/// Numerically ordered UID strings.
pub fn sorted_uids(found: impl IntoIterator<Item = u32>) -> Vec<String> {
    let mut uids: Vec<u32> = found.into_iter().collect();
    uids.sort_unstable();
    uids.into_iter().map(|uid| uid.to_string()).collect()
}

// =============================================================================
// Structure
// =============================================================================

/// Classifies a fetched message.
///
/// Valid voicemails are `multipart/*` with an `audio/*` part. A `text/*`
/// sibling is the transcription.
pub fn classify(uid: &str, fetched: FetchedStructure<'_>) -> StructureOutcome {
    let Some(structure) = fetched.structure else {
        return StructureOutcome::NotVoicemail("no body structure".into());
    };

    let (mime_type, parts) = body_parts(structure);
    if !mime_type.starts_with("multipart/") {
        return StructureOutcome::NotVoicemail(format!("not multipart ({})", mime_type));
    }

    let mut audio = None;
    let mut transcription = None;
    for part in parts {
        if part.mime_type.starts_with("audio/") {
            audio = Some(part);
        } else if part.mime_type.starts_with("text/") {
            transcription = Some(part);
        } else {
            debug!(uid = %uid, mime_type = %part.mime_type, "Ignoring body part");
        }
    }

    let Some(audio) = audio else {
        return StructureOutcome::NotVoicemail("no audio part".into());
    };

    let headers = fetched.header.map(parse_headers).unwrap_or_default();
    let timestamp = headers
        .date
        .or(fetched.internal_date)
        .unwrap_or_else(|| {
            warn!(uid = %uid, "Message has no usable date");
            Utc::now()
        });

    StructureOutcome::Voicemail(RemoteMessage {
        uid: uid.to_string(),
        seen: fetched.seen,
        deleted: fetched.deleted,
        timestamp,
        number: headers.from.as_deref().and_then(sender_number),
        duration: headers.duration,
        audio,
        transcription,
    })
}

/// Returns the top-level MIME type and the direct child parts.
fn body_parts(structure: &BodyStructure<'_>) -> (String, Vec<BodyPart>) {
    match structure {
        BodyStructure::Multipart { common, bodies, .. } => {
            let parts = bodies
                .iter()
                .enumerate()
                .map(|(index, body)| leaf(body, &(index + 1).to_string()))
                .collect();
            (
                format!("multipart/{}", common.ty.subtype.to_ascii_lowercase()),
                parts,
            )
        }
        single => {
            let part = leaf(single, "1");
            (part.mime_type.clone(), vec![part])
        }
    }
}

fn leaf(structure: &BodyStructure<'_>, part_id: &str) -> BodyPart {
    match structure {
        BodyStructure::Basic { common, other, .. }
        | BodyStructure::Text { common, other, .. }
        | BodyStructure::Message { common, other, .. } => BodyPart {
            part_id: part_id.to_string(),
            mime_type: format!("{}/{}", common.ty.ty, common.ty.subtype).to_ascii_lowercase(),
            encoding: encoding_name(&other.transfer_encoding),
            size: i64::from(other.octets),
        },
        BodyStructure::Multipart { common, .. } => BodyPart {
            part_id: part_id.to_string(),
            mime_type: format!("multipart/{}", common.ty.subtype.to_ascii_lowercase()),
            encoding: String::new(),
            size: 0,
        },
    }
}

fn encoding_name(encoding: &ContentEncoding<'_>) -> String {
    match encoding {
        ContentEncoding::SevenBit => "7bit".to_string(),
        ContentEncoding::EightBit => "8bit".to_string(),
        ContentEncoding::Binary => "binary".to_string(),
        ContentEncoding::Base64 => "base64".to_string(),
        ContentEncoding::QuotedPrintable => "quoted-printable".to_string(),
        ContentEncoding::Other(other) => other.to_ascii_lowercase(),
    }
}

#[derive(Debug, Default)]
struct Headers {
    date: Option<DateTime<Utc>>,
    from: Option<String>,
    duration: Option<i64>,
}

fn parse_headers(raw: &[u8]) -> Headers {
    let Some(message) = MessageParser::new().parse(raw) else {
        return Headers::default();
    };

    let date = message
        .date()
        .and_then(|d| DateTime::parse_from_rfc3339(&d.to_rfc3339()).ok())
        .map(|d| d.with_timezone(&Utc));

    let from = message
        .from()
        .and_then(|a| a.first())
        .and_then(|a| a.address())
        .map(str::to_string);

    let duration = message
        .headers()
        .iter()
        .find(|h| h.name().eq_ignore_ascii_case("Content-Duration"))
        .and_then(|h| h.value().as_text())
        .and_then(|d| d.trim().parse().ok());

    Headers {
        date,
        from,
        duration,
    }
}

/// The caller number: the local part of the sender address.
pub fn sender_number(address: &str) -> Option<String> {
    let local = address.split('@').next()?.trim().trim_matches('"');
    (!local.is_empty()).then(|| local.to_string())
}

// =============================================================================
// Part Bodies
// =============================================================================

pub fn fetch_part_query(part_id: &str) -> String {
    format!("(UID BODY.PEEK[{}])", part_id)
}

/// Removes the content transfer encoding of a part.
pub fn decode_part(data: &[u8], encoding: &str) -> SyncResult<Vec<u8>> {
    if encoding.eq_ignore_ascii_case("base64") {
        let compact: Vec<u8> = data
            .iter()
            .copied()
            .filter(|b| !b.is_ascii_whitespace())
            .collect();
        return base64::engine::general_purpose::STANDARD
            .decode(compact)
            .map_err(|e| SyncError::InvalidMessage(format!("bad base64 body: {}", e)));
    }
    Ok(data.to_vec())
}

// =============================================================================
// Flags
// =============================================================================

pub fn store_flags_query(flag: Flag, value: bool) -> String {
    format!(
        "{}FLAGS.SILENT ({})",
        if value { "+" } else { "-" },
        flag.as_imap()
    )
}

// =============================================================================
// Quota
// =============================================================================

/// Reads the `voice` resource out of a GETQUOTAROOT answer.
pub fn voice_quota(quotas: &[ImapQuota]) -> Option<Quota> {
    quotas
        .iter()
        .flat_map(|quota| quota.resources.iter())
        .find(|resource| {
            matches!(
                &resource.name,
                QuotaResourceName::Atom(name) if name.eq_ignore_ascii_case(QUOTA_RESOURCE_VOICE)
            )
        })
        .map(|resource| {
            Quota::new(
                i64::try_from(resource.usage).unwrap_or(-1),
                i64::try_from(resource.limit).unwrap_or(-1),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_imap::imap_proto::parser::parse_response;
    use async_imap::imap_proto::types::{AttributeValue, Response};
    use chrono::TimeZone;

    /// The BODYSTRUCTURE of a `* n FETCH (...)` line.
    fn structure(raw: &'static [u8]) -> BodyStructure<'static> {
        let (_, response) = parse_response(raw).unwrap();
        let Response::Fetch(_, attributes) = response else {
            panic!("not a FETCH response");
        };
        attributes
            .into_iter()
            .find_map(|attribute| match attribute {
                AttributeValue::BodyStructure(structure) => Some(structure),
                _ => None,
            })
            .unwrap()
    }

    const VOICEMAIL: &[u8] = b"* 1 FETCH (BODYSTRUCTURE ((\"TEXT\" \"PLAIN\" (\"CHARSET\" \"UTF-8\") NIL NIL \"7BIT\" 20 1)\
(\"AUDIO\" \"AMR\" (\"NAME\" \"vm.amr\") NIL NIL \"BASE64\" 4000) \"MIXED\"))\r\n";

    const HEADER: &[u8] =
        b"Date: Tue, 05 Mar 2024 10:15:00 +0000\r\nFrom: 5551234@vvm.example\r\nContent-Duration: 17\r\n\r\n";

    #[test]
    fn test_classify_voicemail() {
        let structure = structure(VOICEMAIL);
        let fetched = FetchedStructure {
            seen: true,
            structure: Some(&structure),
            header: Some(HEADER),
            ..Default::default()
        };

        let StructureOutcome::Voicemail(msg) = classify("42", fetched) else {
            panic!("expected a voicemail");
        };
        assert!(msg.seen);
        assert!(!msg.deleted);
        assert_eq!(msg.number.as_deref(), Some("5551234"));
        assert_eq!(msg.duration, Some(17));
        assert_eq!(
            msg.timestamp,
            Utc.with_ymd_and_hms(2024, 3, 5, 10, 15, 0).unwrap()
        );
        assert_eq!(msg.audio.part_id, "2");
        assert_eq!(msg.audio.mime_type, "audio/amr");
        assert_eq!(msg.audio.encoding, "base64");
        assert_eq!(msg.audio.size, 4000);
        assert_eq!(msg.transcription.unwrap().part_id, "1");
    }

    #[test]
    fn test_non_voicemail_is_skipped() {
        let single = structure(b"* 1 FETCH (BODYSTRUCTURE (\"TEXT\" \"PLAIN\" NIL NIL NIL \"7BIT\" 12 1))\r\n");
        let fetched = FetchedStructure {
            structure: Some(&single),
            ..Default::default()
        };
        assert!(matches!(
            classify("7", fetched),
            StructureOutcome::NotVoicemail(_)
        ));

        let text_only = structure(
            b"* 1 FETCH (BODYSTRUCTURE ((\"TEXT\" \"PLAIN\" NIL NIL NIL \"7BIT\" 12 1) \"MIXED\"))\r\n",
        );
        let fetched = FetchedStructure {
            structure: Some(&text_only),
            ..Default::default()
        };
        assert!(matches!(
            classify("8", fetched),
            StructureOutcome::NotVoicemail(_)
        ));

        assert!(matches!(
            classify("9", FetchedStructure::default()),
            StructureOutcome::NotVoicemail(_)
        ));
    }

    #[test]
    fn test_internal_date_fallback() {
        let structure = structure(VOICEMAIL);
        let received = Utc.with_ymd_and_hms(2024, 3, 5, 9, 0, 0).unwrap();
        let fetched = FetchedStructure {
            structure: Some(&structure),
            header: Some(&b"From: \"Caller\" <5559876@carrier.net>\r\n\r\n"[..]),
            internal_date: Some(received),
            ..Default::default()
        };

        let StructureOutcome::Voicemail(msg) = classify("5", fetched) else {
            panic!("expected a voicemail");
        };
        assert_eq!(msg.timestamp, received);
        assert_eq!(msg.number.as_deref(), Some("5559876"));
        assert_eq!(msg.duration, None);
    }

    #[test]
    fn test_sender_number() {
        assert_eq!(sender_number("5551234@vvm.example").as_deref(), Some("5551234"));
        assert_eq!(sender_number("").as_deref(), None);
    }

    #[test]
    fn test_part_section() {
        let mut part = BodyPart {
            part_id: "1.2".into(),
            mime_type: "audio/amr".into(),
            encoding: "base64".into(),
            size: 0,
        };
        assert_eq!(part.section().unwrap(), SectionPath::Part(vec![1, 2], None));

        part.part_id = "x".into();
        assert!(part.section().is_err());
    }

    #[test]
    fn test_queries() {
        assert_eq!(store_flags_query(Flag::Deleted, true), "+FLAGS.SILENT (\\Deleted)");
        assert_eq!(store_flags_query(Flag::Seen, false), "-FLAGS.SILENT (\\Seen)");
        assert_eq!(fetch_part_query("2"), "(UID BODY.PEEK[2])");
        assert_eq!(sorted_uids([12, 3, 9]), vec!["3", "9", "12"]);
    }

    #[test]
    fn test_decode_part() {
        assert_eq!(decode_part(b"aGVs\r\nbG8=", "base64").unwrap(), b"hello");
        assert_eq!(decode_part(b"plain", "7bit").unwrap(), b"plain");
        assert!(decode_part(b"!!!", "base64").is_err());
    }
}
