//! Classification of transport completions.

use tus_protocol::Method;
use tus_protocol::constants::is_auth_status;

use crate::error::TransportError;
use crate::transport::Completion;

/// Success predicate of one protocol operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    /// Exactly this status.
    Exact(u16),
    /// Any 2xx.
    AnySuccess,
}

impl Expected {
    /// Predicate for `method`: POST expects 201, HEAD expects 200 under
    /// strict protocol and any 2xx otherwise, PATCH and OPTIONS any 2xx.
    pub fn for_method(method: Method, strict: bool) -> Self {
        match method {
            Method::Post => Expected::Exact(201),
            Method::Head if strict => Expected::Exact(200),
            Method::Head | Method::Patch | Method::Options => Expected::AnySuccess,
        }
    }

    pub fn matches(&self, status: u16) -> bool {
        match self {
            Expected::Exact(code) => status == *code,
            Expected::AnySuccess => (200..300).contains(&status),
        }
    }
}

/// What a completion means for the protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success { status: u16 },
    AuthRequired { status: u16 },
    Rejected { status: u16 },
    TransportFailure(TransportError),
}

/// Classifies a completion against the operation's success predicate.
///
/// A transport error wins over any partial response; 401/403 are reported
/// as `AuthRequired` regardless of the expected status.
pub fn classify(completion: &Completion, expected: Expected) -> Outcome {
    if let Some(error) = &completion.error {
        return Outcome::TransportFailure(error.clone());
    }
    match completion.status {
        Some(status) if is_auth_status(status) => Outcome::AuthRequired { status },
        Some(status) if expected.matches(status) => Outcome::Success { status },
        Some(status) => Outcome::Rejected { status },
        None => Outcome::TransportFailure(TransportError::new(
            crate::TransportErrorKind::Other,
            "completed without a response",
        )),
    }
}
