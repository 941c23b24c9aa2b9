use anyhow::Context;
use base64::prelude::*;
use hmac::digest::OutputSizeUser;
use hmac::Hmac;
use md5::Md5;
use sha1::Sha1;
use sha2::{Sha224, Sha256, Sha384, Sha512};

/// HMAC algorithms usable with TSIG (RFC 2845/4635).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsigAlgorithm {
    HmacMd5,
    HmacSha1,
    HmacSha224,
    HmacSha256,
    HmacSha384,
    HmacSha512,
}

impl TsigAlgorithm {
    /// Returns the name that identifies this algorithm on the wire.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::HmacMd5 => "hmac-md5.sig-alg.reg.int",
            Self::HmacSha1 => "hmac-sha1",
            Self::HmacSha224 => "hmac-sha224",
            Self::HmacSha256 => "hmac-sha256",
            Self::HmacSha384 => "hmac-sha384",
            Self::HmacSha512 => "hmac-sha512",
        }
    }

    /// Finds an algorithm by name. Accepts both the full wire names and
    /// the shorthand forms that appear in configuration files, in any
    /// case and with or without a trailing dot.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        let name = name.trim_end_matches('.');
        if name.contains("sha224") {
            Some(Self::HmacSha224)
        } else if name.contains("sha256") {
            Some(Self::HmacSha256)
        } else if name.contains("sha384") {
            Some(Self::HmacSha384)
        } else if name.contains("sha512") {
            Some(Self::HmacSha512)
        } else if name.contains("sha1") {
            Some(Self::HmacSha1)
        } else if name.contains("md5") {
            Some(Self::HmacMd5)
        } else {
            None
        }
    }

    /// Returns the size of the MAC produced by this algorithm.
    pub fn output_size(&self) -> usize {
        match self {
            Self::HmacMd5 => Hmac::<Md5>::output_size(),
            Self::HmacSha1 => Hmac::<Sha1>::output_size(),
            Self::HmacSha224 => Hmac::<Sha224>::output_size(),
            Self::HmacSha256 => Hmac::<Sha256>::output_size(),
            Self::HmacSha384 => Hmac::<Sha384>::output_size(),
            Self::HmacSha512 => Hmac::<Sha512>::output_size(),
        }
    }
}

/// A shared secret used to sign and verify zone transfers.
///
/// The decoded secret is wiped when the key is dropped.
#[derive(Clone, PartialEq, Eq)]
pub struct TsigKey {
    pub name: String,
    pub algorithm: TsigAlgorithm,
    secret: Vec<u8>,
}

impl std::fmt::Debug for TsigKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TsigKey")
            .field("name", &self.name)
            .field("algorithm", &self.algorithm)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl TsigKey {
    pub fn new(name: &str, algorithm: TsigAlgorithm, base64_secret: &str) -> anyhow::Result<Self> {
        let secret = BASE64_STANDARD
            .decode(base64_secret.trim())
            .with_context(|| format!("key '{}': secret is not valid base64", name))?;
        Ok(TsigKey {
            name: name.trim_end_matches('.').to_ascii_lowercase(),
            algorithm,
            secret,
        })
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    /// True if `name` refers to this key, ignoring case and a trailing dot.
    pub fn matches_name(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name.trim_end_matches('.'))
    }
}

impl Drop for TsigKey {
    fn drop(&mut self) {
        self.secret.iter_mut().for_each(|byte| *byte = 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algorithm_lookup_is_lenient() {
        assert_eq!(TsigAlgorithm::from_name("HMAC-MD5.SIG-ALG.REG.INT."), Some(TsigAlgorithm::HmacMd5));
        assert_eq!(TsigAlgorithm::from_name("hmac-md5"), Some(TsigAlgorithm::HmacMd5));
        assert_eq!(TsigAlgorithm::from_name("hmac-sha1"), Some(TsigAlgorithm::HmacSha1));
        assert_eq!(TsigAlgorithm::from_name("HMAC-SHA256"), Some(TsigAlgorithm::HmacSha256));
        assert_eq!(TsigAlgorithm::from_name("hmac-sha512."), Some(TsigAlgorithm::HmacSha512));
        assert_eq!(TsigAlgorithm::from_name("gss-tsig"), None);
    }

    #[test]
    fn key_name_is_canonicalized() {
        let key = TsigKey::new("Transfer-Key.Example.COM.", TsigAlgorithm::HmacSha256, "c2VjcmV0").unwrap();
        assert_eq!(key.name, "transfer-key.example.com");
        assert_eq!(key.secret(), b"secret");
        assert!(key.matches_name("TRANSFER-KEY.example.com."));
        assert!(!key.matches_name("other-key.example.com"));
    }

    #[test]
    fn invalid_base64_is_rejected() {
        assert!(TsigKey::new("k", TsigAlgorithm::HmacSha1, "not base64!!!").is_err());
    }
}
