use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use derive_new::new;

// Authentication data attached to an interface.
#[derive(Clone, Debug)]
pub enum AuthMethod {
    // Cleartext password (AuType=1).
    Simple(Vec<u8>),
    // Keyed MD5 digests (AuType=2).
    MessageDigest(AuthKeyring),
}

// Set of MD5 keys configured on an interface, indexed by Key ID.
#[derive(Clone, Debug, Default)]
pub struct AuthKeyring {
    pub keys: BTreeMap<u8, AuthKey>,
}

#[derive(Clone, Debug, Eq, PartialEq, new)]
pub struct AuthKey {
    pub id: u8,
    pub string: Vec<u8>,
}

// Context used when encoding an authenticated packet.
#[derive(Clone, Copy, Debug)]
pub enum AuthEncodeCtx<'a> {
    Simple(&'a [u8]),
    MessageDigest {
        key: &'a AuthKey,
        seqno: &'a Arc<AtomicU64>,
    },
}

// Context used when validating a received packet.
#[derive(Clone, Copy, Debug, new)]
pub struct AuthDecodeCtx<'a> {
    pub method: &'a AuthMethod,
}

// MD5 digest size in bytes.
pub const MD5_DIGEST_SIZE: u8 = 16;
// Maximum cleartext password size in bytes.
pub const SIMPLE_PASSWD_SIZE: usize = 8;

// ===== impl AuthMethod =====

impl AuthMethod {
    // Returns the encode context used to authenticate an outgoing packet, or
    // `None` when no valid key is available.
    pub fn encode_ctx<'a>(
        &'a self,
        seqno: &'a Arc<AtomicU64>,
    ) -> Option<AuthEncodeCtx<'a>> {
        match self {
            AuthMethod::Simple(passwd) => {
                Some(AuthEncodeCtx::Simple(passwd))
            }
            AuthMethod::MessageDigest(keyring) => keyring
                .key_lookup_send()
                .map(|key| AuthEncodeCtx::MessageDigest { key, seqno }),
        }
    }
}

// ===== impl AuthKeyring =====

impl AuthKeyring {
    // Returns the key used to authenticate received packets.
    pub(crate) fn key_lookup_accept(&self, id: u8) -> Option<&AuthKey> {
        self.keys.get(&id)
    }

    // Returns the key used to authenticate outgoing packets.
    //
    // When multiple keys are configured, the one with the highest Key ID is
    // preferred (this is how rolling key updates converge: both routers end
    // up generating with the newest commonly-configured key).
    pub(crate) fn key_lookup_send(&self) -> Option<&AuthKey> {
        self.keys.values().next_back()
    }
}

// ===== global functions =====

// Computes the keyed MD5 digest of an OSPF packet: MD5 over the packet
// concatenated with the authentication key padded to 16 bytes.
pub(crate) fn message_digest(data: &[u8], key: &[u8]) -> [u8; 16] {
    use md5::{Digest, Md5};

    let mut key = key.to_vec();
    key.resize(16, 0);

    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.update(&key);
    hasher.finalize().into()
}

// Pads a cleartext password to the size of the authentication field.
pub(crate) fn simple_passwd(passwd: &[u8]) -> [u8; SIMPLE_PASSWD_SIZE] {
    let mut auth_data = [0; SIMPLE_PASSWD_SIZE];
    let len = std::cmp::min(passwd.len(), SIMPLE_PASSWD_SIZE);
    auth_data[..len].copy_from_slice(&passwd[..len]);
    auth_data
}
