use byteorder::{LittleEndian, WriteBytesExt};
use ctor::ctor;
use libsodium_sys;

pub const MAC_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_ABYTES as usize;
pub const KEY_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_KEYBYTES as usize;
pub const NONCE_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_NPUBBYTES as usize;

const NONCE_OFFSET: usize = NONCE_SIZE - 8;

/// Initialize the sodium infrastructure
#[ctor]
fn INIT_SODIUM() {
    unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("Cryptography initialization failed")
        }
    }
}

#[inline]
fn nonce_to_bytes(nonce: u64) -> [u8; NONCE_SIZE] {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    (&mut nonce_bytes[NONCE_OFFSET..])
        .write_u64::<LittleEndian>(nonce)
        .expect("Error creating nonce");
    nonce_bytes
}

/// Encrypts the buffer in place. The final `MAC_SIZE` bytes of the buffer receive the
/// authentication tag; everything before them is sealed. The buffer must therefore be
/// `plain_len + MAC_SIZE` bytes long.
///
/// The additional data, nonce and key must match those used during decryption, the
/// decryption will fail otherwise.
#[inline]
pub fn seal_in_place(
    buf: &mut [u8],
    plain_len: usize,
    additional_data: &[u8],
    nonce: u64,
    key: &[u8; KEY_SIZE],
) -> bool {
    let nonce_bytes = nonce_to_bytes(nonce);

    if buf.len() != plain_len + MAC_SIZE {
        panic!(
            "Encryption: buffer length ({}) must be plain data length ({}) + MAC size ({})",
            buf.len(),
            plain_len,
            MAC_SIZE
        )
    }

    unsafe {
        let result = libsodium_sys::crypto_aead_chacha20poly1305_ietf_encrypt(
            buf.as_mut_ptr(),
            ::std::ptr::null_mut(),
            buf.as_ptr(),
            plain_len as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            ::std::ptr::null(),
            nonce_bytes.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Decrypts the buffer in place. On success the leading `buf.len() - MAC_SIZE` bytes
/// hold the plain text; the trailing tag bytes are left untouched.
#[inline]
pub fn open_in_place(
    buf: &mut [u8],
    additional_data: &[u8],
    nonce: u64,
    key: &[u8; KEY_SIZE],
) -> bool {
    let nonce_bytes = nonce_to_bytes(nonce);

    if buf.len() < MAC_SIZE {
        return false;
    }

    unsafe {
        let result = libsodium_sys::crypto_aead_chacha20poly1305_ietf_decrypt(
            buf.as_mut_ptr(),
            ::std::ptr::null_mut(),
            ::std::ptr::null_mut(),
            buf.as_ptr(),
            buf.len() as u64,
            additional_data.as_ptr(),
            additional_data.len() as u64,
            nonce_bytes.as_ptr(),
            key.as_ptr(),
        );

        result >= 0
    }
}

/// Expands short key material into a full cipher key with an unkeyed BLAKE2b hash.
/// Both peers run the same expansion, so equal inputs yield equal cipher keys.
#[inline]
pub fn expand_key(seed: &[u8]) -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];

    unsafe {
        let result = libsodium_sys::crypto_generichash(
            key.as_mut_ptr(),
            KEY_SIZE,
            seed.as_ptr(),
            seed.len() as u64,
            ::std::ptr::null(),
            0,
        );

        if result < 0 {
            panic!("Key expansion failed")
        }
    }

    key
}

/// Fills the provided buffer with cryptographically secure random bytes
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    unsafe {
        libsodium_sys::randombytes_buf(out.as_mut_ptr() as *mut ::std::ffi::c_void, out.len());
    }
}
