use std::time::Duration;

use ironzone_lib::ResponseCode;
use ironzone_tsig::TsigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum XferError {
    #[error("couldn't connect to the master: {0}")]
    Connect(#[source] std::io::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transfer deadline exceeded")]
    Timeout,
    #[error("response exceeds the configured size limit")]
    ResponseTooLarge,
    #[error("malformed response: {0}")]
    Parse(#[source] anyhow::Error),
    #[error("signature error: {0}")]
    Tsig(#[from] TsigError),
    #[error("master refused the transfer: {0:?}")]
    Refused(ResponseCode),
    #[error("storage error: {0}")]
    Store(#[source] anyhow::Error),
}

impl XferError {
    /// Short status tag for the transfer log. Oversized responses count
    /// as parse errors: the stream was cut before it made sense.
    pub fn status(&self) -> &'static str {
        match self {
            XferError::Connect(_) => "connect-error",
            XferError::Io(_) => "io-error",
            XferError::Timeout => "timeout",
            XferError::ResponseTooLarge | XferError::Parse(_) => "parse-error",
            XferError::Tsig(_) => "tsig-error",
            XferError::Refused(ResponseCode::NotAuth) => "not-authoritative",
            XferError::Refused(_) => "refused",
            XferError::Store(_) => "store-error",
        }
    }
}

/// A finished inbound transfer
#[derive(Debug)]
pub struct XferOutcome {
    pub origin: String,
    pub new_serial: u32,
    /// Every RR received on the wire, the two SOAs included
    pub records_received: usize,
    /// What the apply step actually changed in the store
    pub records_added: usize,
    pub records_updated: usize,
    pub records_deleted: usize,
    pub bytes_received: usize,
    pub messages_received: usize,
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_responses_log_as_parse_errors() {
        assert_eq!(XferError::ResponseTooLarge.status(), "parse-error");
        assert_eq!(XferError::Parse(anyhow::anyhow!("boom")).status(), "parse-error");
        assert_eq!(XferError::Timeout.status(), "timeout");
    }

    #[test]
    fn authority_failures_log_apart_from_plain_refusals() {
        assert_eq!(XferError::Refused(ResponseCode::NotAuth).status(), "not-authoritative");
        assert_eq!(XferError::Refused(ResponseCode::Refused).status(), "refused");
        assert_eq!(XferError::Refused(ResponseCode::ServerFailure).status(), "refused");
    }
}
