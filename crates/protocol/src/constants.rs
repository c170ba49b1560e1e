use std::fmt;

use serde::{Deserialize, Serialize};

/// Protocol version sent in every `Tus-Resumable` header.
pub const TUS_VERSION: &str = "1.0.0";

pub const HEADER_TUS_RESUMABLE: &str = "Tus-Resumable";
pub const HEADER_TUS_EXTENSION: &str = "Tus-Extension";
pub const HEADER_UPLOAD_LENGTH: &str = "Upload-Length";
pub const HEADER_UPLOAD_OFFSET: &str = "Upload-Offset";
pub const HEADER_UPLOAD_METADATA: &str = "Upload-Metadata";
pub const HEADER_UPLOAD_CONCAT: &str = "Upload-Concat";
pub const HEADER_LOCATION: &str = "Location";
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_CONTENT_LENGTH: &str = "Content-Length";

/// Content type required on every PATCH body.
pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

/// `Upload-Concat` value marking a partial resource.
pub const CONCAT_PARTIAL: &str = "partial";

/// Status codes that mean the caller must (re)authenticate.
pub const STATUS_UNAUTHORIZED: u16 = 401;
pub const STATUS_FORBIDDEN: u16 = 403;

/// Returns `true` for 401/403.
pub fn is_auth_status(status: u16) -> bool {
    status == STATUS_UNAUTHORIZED || status == STATUS_FORBIDDEN
}

/// Builds the `Upload-Concat` value of a final (merge) request.
///
/// Partial URLs are space-separated in the order given.
pub fn concat_final_value<I, S>(partial_urls: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let urls: Vec<String> = partial_urls
        .into_iter()
        .map(|u| u.as_ref().to_string())
        .collect();
    format!("final;{}", urls.join(" "))
}

/// HTTP verbs used by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    #[serde(rename = "OPTIONS")]
    Options,
    #[serde(rename = "POST")]
    Post,
    #[serde(rename = "HEAD")]
    Head,
    #[serde(rename = "PATCH")]
    Patch,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Options => "OPTIONS",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Patch => "PATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol extension a server may advertise in `Tus-Extension`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Extension {
    #[serde(rename = "creation")]
    Creation,
    #[serde(rename = "creation-defer-length")]
    CreationDeferLength,
    #[serde(rename = "creation-with-upload")]
    CreationWithUpload,
    #[serde(rename = "expiration")]
    Expiration,
    #[serde(rename = "checksum")]
    Checksum,
    #[serde(rename = "checksum-trailer")]
    ChecksumTrailer,
    #[serde(rename = "termination")]
    Termination,
    #[serde(rename = "concatenation")]
    Concatenation,
    #[serde(rename = "concatenation-unfinished")]
    ConcatenationUnfinished,

    /// Forward compatibility: extensions this client does not know.
    #[serde(other)]
    Unknown,
}

impl Extension {
    /// Maps a single extension name to its variant.
    pub fn from_name(name: &str) -> Self {
        match name {
            "creation" => Extension::Creation,
            "creation-defer-length" => Extension::CreationDeferLength,
            "creation-with-upload" => Extension::CreationWithUpload,
            "expiration" => Extension::Expiration,
            "checksum" => Extension::Checksum,
            "checksum-trailer" => Extension::ChecksumTrailer,
            "termination" => Extension::Termination,
            "concatenation" => Extension::Concatenation,
            "concatenation-unfinished" => Extension::ConcatenationUnfinished,
            _ => Extension::Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Extension::Creation => "creation",
            Extension::CreationDeferLength => "creation-defer-length",
            Extension::CreationWithUpload => "creation-with-upload",
            Extension::Expiration => "expiration",
            Extension::Checksum => "checksum",
            Extension::ChecksumTrailer => "checksum-trailer",
            Extension::Termination => "termination",
            Extension::Concatenation => "concatenation",
            Extension::ConcatenationUnfinished => "concatenation-unfinished",
            Extension::Unknown => "unknown",
        }
    }
}

/// Parses a comma-separated `Tus-Extension` header value.
///
/// Whitespace around names is ignored; unknown names are dropped.
pub fn parse_extensions(header: &str) -> Vec<Extension> {
    header
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(Extension::from_name)
        .filter(|ext| *ext != Extension::Unknown)
        .collect()
}
