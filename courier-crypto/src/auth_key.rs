//! The 256-byte authorization key shared with a data center.

/// A permanent authorization key plus its pre-computed 8-byte identifier.
///
/// The key id is what an encrypted frame leads with, letting the receiver
/// select the right key before any decryption happens.
#[derive(Clone)]
pub struct AuthKey {
    pub(crate) data: [u8; 256],
    pub(crate) key_id: [u8; 8],
}

impl AuthKey {
    /// Construct from the raw 256-byte key material.
    pub fn from_bytes(data: [u8; 256]) -> Self {
        let sha = crate::sha1!(&data);
        let mut key_id = [0u8; 8];
        key_id.copy_from_slice(&sha[12..20]);
        Self { data, key_id }
    }

    /// The raw 256-byte representation, for persistence.
    pub fn to_bytes(&self) -> [u8; 256] {
        self.data
    }

    /// The 8-byte key identifier (`SHA-1(key)[12..20]`).
    pub fn key_id(&self) -> [u8; 8] {
        self.key_id
    }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthKey(id={})", i64::from_le_bytes(self.key_id))
    }
}

impl PartialEq for AuthKey {
    fn eq(&self, other: &Self) -> bool {
        self.key_id == other.key_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_id_is_sha1_tail() {
        let key = AuthKey::from_bytes([0x55; 256]);
        let sha = crate::sha1!(&[0x55u8; 256]);
        assert_eq!(key.key_id(), &sha[12..20]);
    }

    #[test]
    fn equality_is_by_id() {
        let a = AuthKey::from_bytes([1; 256]);
        let b = AuthKey::from_bytes([1; 256]);
        let c = AuthKey::from_bytes([2; 256]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
