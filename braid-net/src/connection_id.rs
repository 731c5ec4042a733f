use rand::Rng;
use std::{
    convert::TryFrom,
    fmt::{self, Formatter},
};

/// identifier of a logical mirrored connection
///
/// 4 opaque bytes drawn uniformly from the ASCII letters, generated by
/// the left side when it accepts a client socket and echoed verbatim by
/// every physical path carrying the same stream. Uniqueness is
/// probabilistic; the left side re-draws while the identifier is
/// already present in its local table.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy)]
pub struct ConnectionId([u8; Self::SIZE]);

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

impl ConnectionId {
    pub const SIZE: usize = 4;

    pub fn generate<R: Rng>(rng: &mut R) -> Self {
        let mut cid = [0; Self::SIZE];
        for byte in cid.iter_mut() {
            *byte = ALPHABET[rng.gen_range(0..ALPHABET.len())];
        }
        Self(cid)
    }

    pub const fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for ConnectionId {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl<'a> TryFrom<&'a [u8]> for ConnectionId {
    type Error = std::array::TryFromSliceError;
    fn try_from(value: &'a [u8]) -> Result<Self, Self::Error> {
        <[u8; Self::SIZE]>::try_from(value).map(Self)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // identifiers we generate are always letters; anything else came
        // from the wire and is shown as hex rather than raw bytes
        if self.0.iter().all(|byte| byte.is_ascii_alphabetic()) {
            for byte in self.0.iter() {
                fmt::Write::write_char(f, *byte as char)?;
            }
            Ok(())
        } else {
            f.write_str(&hex::encode(self.0))
        }
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionId")
            .field(&self.to_string())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng as _};

    #[test]
    fn generated_from_letters_only() {
        let mut rng = StdRng::seed_from_u64(0x1234);
        for _ in 0..1_024 {
            let cid = ConnectionId::generate(&mut rng);
            assert!(cid.as_ref().iter().all(|byte| byte.is_ascii_alphabetic()));
        }
    }

    #[test]
    fn display_letters_verbatim() {
        let cid = ConnectionId::from_bytes(*b"aBcD");
        assert_eq!(cid.to_string(), "aBcD");
    }

    #[test]
    fn display_non_letters_as_hex() {
        let cid = ConnectionId::from_bytes([0x00, 0xff, b'a', b'b']);
        assert_eq!(cid.to_string(), "00ff6162");
    }

    #[test]
    fn from_slice() {
        let cid = ConnectionId::try_from(b"WxYz".as_ref()).unwrap();
        assert_eq!(cid, ConnectionId::from_bytes(*b"WxYz"));
        assert!(ConnectionId::try_from(b"too long".as_ref()).is_err());
    }
}
