// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The Authenticode digest pipeline: a single streaming hasher abstraction
//! shared by all three container handlers so each can feed it bytes in
//! its own container-defined order without knowing which algorithm was
//! selected.

use {
    bcder::Oid,
    digest::Digest as _,
    md5::Md5,
    sha1::Sha1,
    sha2::Sha256,
    std::fmt::{self, Display, Formatter},
};

/// The digest algorithms Authenticode signatures may use.
///
/// `Md5` and `Sha1` exist for compatibility with older signatures; `Sha256`
/// is the modern default. There is deliberately no `Sha384`/`Sha512`
/// variant: Authenticode tooling in the wild does not emit them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha1,
    Sha256,
}

impl Default for DigestAlgorithm {
    fn default() -> Self {
        Self::Sha1
    }
}

impl Display for DigestAlgorithm {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Md5 => f.write_str("md5"),
            Self::Sha1 => f.write_str("sha1"),
            Self::Sha256 => f.write_str("sha2"),
        }
    }
}

impl TryFrom<&str> for DigestAlgorithm {
    type Error = crate::AuthenticodeError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha2" | "sha256" => Ok(Self::Sha256),
            other => Err(crate::AuthenticodeError::InvalidArgs(format!(
                "unrecognized digest algorithm `{other}` (expected md5, sha1, or sha2)"
            ))),
        }
    }
}

impl DigestAlgorithm {
    /// Length in bytes of a digest produced by this algorithm.
    pub fn hash_len(&self) -> usize {
        match self {
            Self::Md5 => 16,
            Self::Sha1 => 20,
            Self::Sha256 => 32,
        }
    }

    /// The ASN.1 object identifier used as `messageDigest.digestAlgorithm`
    /// inside `SpcIndirectDataContent` and as the PKCS#7 `digestAlgorithm`.
    pub fn oid(&self) -> Oid<&'static [u8]> {
        match self {
            // 1.2.840.113549.2.5
            Self::Md5 => Oid(&[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x02, 0x05]),
            // 1.3.14.3.2.26
            Self::Sha1 => Oid(&[0x2b, 0x0e, 0x03, 0x02, 0x1a]),
            // 2.16.840.1.101.3.4.2.1
            Self::Sha256 => Oid(&[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01]),
        }
    }

    /// Obtain a fresh streaming hasher for this algorithm.
    pub fn as_hasher(&self) -> DigestHasher {
        match self {
            Self::Md5 => DigestHasher::Md5(Md5::new()),
            Self::Sha1 => DigestHasher::Sha1(Sha1::new()),
            Self::Sha256 => DigestHasher::Sha256(Sha256::new()),
        }
    }

    /// Digest a single byte slice in one shot.
    pub fn digest_data(&self, data: &[u8]) -> Vec<u8> {
        let mut hasher = self.as_hasher();
        hasher.update(data);
        hasher.finish()
    }
}

/// A streaming hash context. Container handlers call [`DigestHasher::update`]
/// once per byte range they feed through, in the container-specific order
/// the Authenticode digest recipe requires, then call
/// [`DigestHasher::finish`] once at the end.
pub enum DigestHasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
}

impl DigestHasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(h) => h.update(data),
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
        }
    }

    pub fn finish(self) -> Vec<u8> {
        match self {
            Self::Md5(h) => h.finalize().to_vec(),
            Self::Sha1(h) => h.finalize().to_vec(),
            Self::Sha256(h) => h.finalize().to_vec(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bcder::encode::Values;

    #[test]
    fn default_is_sha1() {
        assert_eq!(DigestAlgorithm::default(), DigestAlgorithm::Sha1);
    }

    #[test]
    fn sha256_oid_matches_s2() {
        // scenario S2: 2.16.840.1.101.3.4.2.1, 32-byte digest
        assert_eq!(DigestAlgorithm::Sha256.hash_len(), 32);
        let mut der = Vec::new();
        DigestAlgorithm::Sha256
            .oid()
            .encode_ref()
            .write_encoded(bcder::Mode::Der, &mut der)
            .unwrap();
        assert_eq!(hex::encode(&der), "06096086480165030402 01".replace(' ', ""));
    }

    #[test]
    fn hash_lengths() {
        assert_eq!(DigestAlgorithm::Md5.hash_len(), 16);
        assert_eq!(DigestAlgorithm::Sha1.hash_len(), 20);
        assert_eq!(DigestAlgorithm::Sha256.hash_len(), 32);
    }

    #[test]
    fn digest_data_matches_hash_len() {
        for alg in [DigestAlgorithm::Md5, DigestAlgorithm::Sha1, DigestAlgorithm::Sha256] {
            assert_eq!(alg.digest_data(b"hello world").len(), alg.hash_len());
        }
    }
}
