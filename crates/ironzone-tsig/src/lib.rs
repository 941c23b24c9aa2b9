mod key;
mod session;

pub use key::{TsigAlgorithm, TsigKey};
pub use session::{
    extract_mac, locate_tsig, sign_message, verify_message, LocatedTsig, SigningSession, VerifySession, DEFAULT_FUDGE,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TsigError {
    #[error("message is not signed")]
    NotSigned,
    #[error("TSIG RR is not the last record of the additional section")]
    NotLast,
    #[error("signature verification failed")]
    BadSig,
    #[error("unknown key or algorithm: {0}")]
    BadKey(String),
    #[error("signature is outside of the allowed time window")]
    BadTime,
    #[error("MAC is truncated")]
    BadTrunc,
    #[error("malformed TSIG record: {0}")]
    Malformed(#[source] anyhow::Error),
}

impl TsigError {
    /// Extended RCODE for the error field of an unsigned TSIG RR in an
    /// error response (RFC 2845 §1.7, RFC 4635 §1.4)
    pub fn extended_rcode(&self) -> u16 {
        match self {
            TsigError::BadSig => 16,
            TsigError::BadKey(_) => 17,
            TsigError::BadTime => 18,
            TsigError::BadTrunc => 22,
            _ => 1,
        }
    }
}
