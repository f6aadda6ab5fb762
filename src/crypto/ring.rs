use ring::{aead, hkdf, hmac};

use crate::config::ConfigError;
use crate::crypto::{self, CryptoError, KeyPair};
use crate::shared::ConnectionId;
use crate::Side;

/// draft-29 initial salt
const INITIAL_SALT: [u8; 20] = [
    0xaf, 0xbf, 0xec, 0x28, 0x99, 0x93, 0xd2, 0x4c, 0x9e, 0x97, 0x86, 0xf1, 0x9c, 0x61, 0x11,
    0xe0, 0x43, 0x90, 0xa8, 0x99,
];

/// Header protection key on `ring`'s QUIC primitives
pub struct HeaderKey(aead::quic::HeaderProtectionKey);

impl crypto::HeaderKey for HeaderKey {
    fn mask(&self, sample: &[u8]) -> [u8; 5] {
        self.0.new_mask(sample).unwrap()
    }

    fn sample_size(&self) -> usize {
        self.0.algorithm().sample_len()
    }
}

/// AEAD packet protection key with its IV
pub struct PacketKey {
    key: aead::LessSafeKey,
    iv: [u8; aead::NONCE_LEN],
}

impl PacketKey {
    fn nonce(&self, packet_number: u64) -> aead::Nonce {
        let mut nonce = self.iv;
        for (b, v) in nonce[4..].iter_mut().zip(packet_number.to_be_bytes()) {
            *b ^= v;
        }
        aead::Nonce::assume_unique_for_key(nonce)
    }
}

impl crypto::PacketKey for PacketKey {
    fn decrypt_in_place(
        &self,
        packet_number: u64,
        aad: &[u8],
        payload: &mut [u8],
    ) -> Result<usize, CryptoError> {
        let plain = self
            .key
            .open_in_place(self.nonce(packet_number), aead::Aad::from(aad), payload)
            .map_err(|_| CryptoError)?;
        Ok(plain.len())
    }

    fn encrypt_in_place(
        &self,
        packet_number: u64,
        aad: &[u8],
        buf: &mut [u8],
        payload_len: usize,
    ) -> usize {
        let tag = self
            .key
            .seal_in_place_separate_tag(
                self.nonce(packet_number),
                aead::Aad::from(aad),
                &mut buf[..payload_len],
            )
            .unwrap();
        let tag = tag.as_ref();
        buf[payload_len..payload_len + tag.len()].copy_from_slice(tag);
        payload_len + tag.len()
    }

    fn tag_len(&self) -> usize {
        self.key.algorithm().tag_len()
    }
}

impl crypto::HmacKey for hmac::Key {
    type Signature = hmac::Tag;

    fn new(key: &[u8]) -> Result<Self, ConfigError> {
        if key.is_empty() {
            return Err(ConfigError::IllegalValue("empty hmac key"));
        }
        Ok(hmac::Key::new(hmac::HMAC_SHA256, key))
    }

    fn sign(&self, data: &[u8]) -> Self::Signature {
        hmac::sign(self, data)
    }
}

struct OkmLen(usize);

impl hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

fn expand_label(prk: &hkdf::Prk, label: &[u8], out: &mut [u8]) {
    const BASE: &[u8] = b"tls13 ";
    let mut info = Vec::with_capacity(2 + 1 + BASE.len() + label.len() + 1);
    info.extend_from_slice(&(out.len() as u16).to_be_bytes());
    info.push((BASE.len() + label.len()) as u8);
    info.extend_from_slice(BASE);
    info.extend_from_slice(label);
    info.push(0);
    prk.expand(&[&info], OkmLen(out.len()))
        .unwrap()
        .fill(out)
        .unwrap();
}

fn keys_from_secret(secret: &hkdf::Prk) -> (HeaderKey, PacketKey) {
    let mut key = [0u8; 16];
    let mut iv = [0u8; aead::NONCE_LEN];
    let mut hp = [0u8; 16];
    expand_label(secret, b"quic key", &mut key);
    expand_label(secret, b"quic iv", &mut iv);
    expand_label(secret, b"quic hp", &mut hp);

    let packet = PacketKey {
        key: aead::LessSafeKey::new(aead::UnboundKey::new(&aead::AES_128_GCM, &key).unwrap()),
        iv,
    };
    let header = HeaderKey(aead::quic::HeaderProtectionKey::new(&aead::quic::AES_128, &hp).unwrap());
    (header, packet)
}

/// Derive the epoch-0 packet protection keys from the client's first
/// destination CID, per the draft-29 key schedule
pub fn initial_keys(
    dst_cid: &ConnectionId,
    side: Side,
) -> (KeyPair<HeaderKey>, KeyPair<PacketKey>) {
    let initial_secret = hkdf::Salt::new(hkdf::HKDF_SHA256, &INITIAL_SALT).extract(dst_cid);

    let mut client_secret = [0u8; 32];
    expand_label(&initial_secret, b"client in", &mut client_secret);
    let client_prk = hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, &client_secret);
    let (client_header, client_packet) = keys_from_secret(&client_prk);

    let mut server_secret = [0u8; 32];
    expand_label(&initial_secret, b"server in", &mut server_secret);
    let server_prk = hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, &server_secret);
    let (server_header, server_packet) = keys_from_secret(&server_prk);

    match side {
        Side::Client => (
            KeyPair {
                local: client_header,
                remote: server_header,
            },
            KeyPair {
                local: client_packet,
                remote: server_packet,
            },
        ),
        Side::Server => (
            KeyPair {
                local: server_header,
                remote: client_header,
            },
            KeyPair {
                local: server_packet,
                remote: client_packet,
            },
        ),
    }
}
