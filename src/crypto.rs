//! Cryptographic channel: key derivation, the PSK handshake, and data-frame
//! wrap/unwrap.
//!
//! Both sides derive an AES-256 key and an HMAC key from the pre-shared key
//! with PBKDF2-HMAC-SHA256 (10000 iterations) over a 16-byte salt the client
//! generates per session; the HMAC key uses the same salt with every byte
//! XORed with `0xAA`. Data frames carry `data_iv || AES-256-CBC(PKCS#7
//! plaintext)` authenticated by HMAC-SHA-256 over those payload bytes.
//!
//! Session keys are an immutable [`SessionKeys`] value swapped atomically on
//! handshake completion; wrap/unwrap hold an `Arc` snapshot for the duration
//! of one operation, so there are no locks on the hot path beyond the
//! snapshot read. Key material is zeroized when the last snapshot drops.

use crate::error::CryptoError;
use crate::frame::{encode_frame, Frame, PacketType, HEADER_IV_SIZE, HMAC_SIZE};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::{Rng, RngCore};
use sha2::Sha256;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// AES-256 key size; the HMAC key uses the same size.
pub const KEY_SIZE: usize = 32;

/// Key-derivation salt size, carried in the AUTH_REQUEST payload.
pub const SALT_SIZE: usize = 16;

/// PBKDF2 iteration count. Fixed, not negotiated.
pub const PBKDF2_ITERATIONS: u32 = 10_000;

/// Minimum accepted pre-shared key length in bytes.
pub const MIN_PSK_LEN: usize = 16;

/// Sessions older than this must re-run the handshake.
pub const REAUTH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Byte XORed over the salt to derive the HMAC-key salt.
const HMAC_SALT_MASK: u8 = 0xAA;

/// Immutable per-session key material. Zeroized when the last snapshot
/// reference drops.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    aes_key: [u8; KEY_SIZE],
    hmac_key: [u8; KEY_SIZE],
}

/// Authenticated, encrypted channel state for one peer.
pub struct CryptoChannel {
    psk: Zeroizing<Vec<u8>>,
    keys: RwLock<Option<Arc<SessionKeys>>>,
    authenticated: AtomicBool,
    auth_time: Mutex<Option<Instant>>,
}

impl CryptoChannel {
    /// Create a channel from a pre-shared key.
    ///
    /// Fails with [`CryptoError::BadPsk`] when the key is shorter than
    /// [`MIN_PSK_LEN`] bytes.
    pub fn new(psk: &[u8]) -> Result<Self, CryptoError> {
        if psk.len() < MIN_PSK_LEN {
            return Err(CryptoError::BadPsk(psk.len()));
        }

        Ok(Self {
            psk: Zeroizing::new(psk.to_vec()),
            keys: RwLock::new(None),
            authenticated: AtomicBool::new(false),
            auth_time: Mutex::new(None),
        })
    }

    /// Build the client's AUTH_REQUEST frame.
    ///
    /// Generates a fresh salt, derives the session keys from it, and returns
    /// a frame whose payload is the salt and whose HMAC covers it. The
    /// channel is not authenticated until the server's response verifies.
    pub fn create_auth_request(&self) -> Result<Bytes, CryptoError> {
        let mut salt = [0u8; SALT_SIZE];
        rand::rng().fill_bytes(&mut salt);

        let keys = Arc::new(self.derive_keys(&salt));
        let hmac = compute_hmac(&keys.hmac_key, &salt);

        *self.keys.write().expect("keys lock poisoned") = Some(keys);
        self.authenticated.store(false, Ordering::SeqCst);

        Ok(encode_frame(
            PacketType::AuthRequest,
            &random_iv(),
            &hmac,
            &salt,
        ))
    }

    /// Server side: verify an AUTH_REQUEST and produce the AUTH_SUCCESS
    /// response.
    ///
    /// Derives keys from the received salt and checks the request HMAC in
    /// constant time. On mismatch no keys are stored and the caller must not
    /// send any response (silent failure keeps the oracle small).
    pub fn handle_auth_request(&self, frame: &Frame) -> Result<Bytes, CryptoError> {
        if frame.header.packet_type != PacketType::AuthRequest.as_byte() {
            return Err(CryptoError::WrongType(frame.header.packet_type));
        }
        if frame.payload.len() != SALT_SIZE {
            return Err(CryptoError::ShortFrame("auth request salt"));
        }

        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&frame.payload);

        let keys = Arc::new(self.derive_keys(&salt));
        let expected = compute_hmac(&keys.hmac_key, &salt);
        if !bool::from(expected[..].ct_eq(&frame.header.hmac)) {
            return Err(CryptoError::HmacMismatch);
        }

        let response_hmac = compute_hmac(&keys.hmac_key, &[]);

        *self.keys.write().expect("keys lock poisoned") = Some(keys);
        self.authenticated.store(true, Ordering::SeqCst);
        *self.auth_time.lock().expect("auth_time lock poisoned") = Some(Instant::now());

        Ok(encode_frame(
            PacketType::AuthSuccess,
            &random_iv(),
            &response_hmac,
            &[],
        ))
    }

    /// Client side: verify the server's handshake response.
    ///
    /// Accepts AUTH_SUCCESS and the legacy AUTH_RESPONSE type. The response
    /// HMAC covers the empty payload. On mismatch the pending keys are
    /// cleared and the handshake returns to idle.
    pub fn handle_auth_response(&self, frame: &Frame) -> Result<(), CryptoError> {
        match PacketType::from_byte(frame.header.packet_type) {
            Some(PacketType::AuthSuccess) | Some(PacketType::AuthResponse) => {}
            _ => return Err(CryptoError::WrongType(frame.header.packet_type)),
        }

        let keys = self.keys_snapshot()?;
        let expected = compute_hmac(&keys.hmac_key, &[]);
        if !bool::from(expected[..].ct_eq(&frame.header.hmac)) {
            self.clear_session();
            return Err(CryptoError::HmacMismatch);
        }

        self.authenticated.store(true, Ordering::SeqCst);
        *self.auth_time.lock().expect("auth_time lock poisoned") = Some(Instant::now());
        Ok(())
    }

    /// Encrypt and frame one plaintext packet.
    ///
    /// Refuses before authentication. The frame payload is
    /// `data_iv || AES-256-CBC(plaintext)` with PKCS#7 padding; the header
    /// carries a separate random IV and the HMAC over the payload bytes.
    pub fn wrap(&self, data: &[u8]) -> Result<Bytes, CryptoError> {
        if !self.is_authenticated() {
            return Err(CryptoError::NotAuthenticated);
        }
        let keys = self.keys_snapshot()?;

        let mut data_iv = [0u8; HEADER_IV_SIZE];
        rand::rng().fill_bytes(&mut data_iv);

        let ciphertext = Aes256CbcEnc::new((&keys.aes_key).into(), (&data_iv).into())
            .encrypt_padded_vec_mut::<Pkcs7>(data);

        let mut payload = Vec::with_capacity(HEADER_IV_SIZE + ciphertext.len());
        payload.extend_from_slice(&data_iv);
        payload.extend_from_slice(&ciphertext);

        let hmac = compute_hmac(&keys.hmac_key, &payload);
        Ok(encode_frame(PacketType::Data, &random_iv(), &hmac, &payload))
    }

    /// Verify and decrypt one data frame.
    ///
    /// Refuses before authentication. The HMAC is checked in constant time
    /// before any decryption; a mismatch or bad padding never yields
    /// plaintext.
    pub fn unwrap(&self, frame: &Frame) -> Result<Vec<u8>, CryptoError> {
        if !self.is_authenticated() {
            return Err(CryptoError::NotAuthenticated);
        }
        if frame.header.packet_type != PacketType::Data.as_byte() {
            return Err(CryptoError::WrongType(frame.header.packet_type));
        }
        let keys = self.keys_snapshot()?;

        let expected = compute_hmac(&keys.hmac_key, &frame.payload);
        if !bool::from(expected[..].ct_eq(&frame.header.hmac)) {
            return Err(CryptoError::HmacMismatch);
        }

        // Smallest valid payload: the data IV plus one padded cipher block.
        let ciphertext = &frame.payload[..];
        if ciphertext.len() < HEADER_IV_SIZE + 16
            || (ciphertext.len() - HEADER_IV_SIZE) % 16 != 0
        {
            return Err(CryptoError::BadPadding);
        }

        let (data_iv, encrypted) = ciphertext.split_at(HEADER_IV_SIZE);
        let mut data_iv_arr = [0u8; HEADER_IV_SIZE];
        data_iv_arr.copy_from_slice(data_iv);

        Aes256CbcDec::new((&keys.aes_key).into(), (&data_iv_arr).into())
            .decrypt_padded_vec_mut::<Pkcs7>(encrypted)
            .map_err(|_| CryptoError::BadPadding)
    }

    /// Whether the handshake has completed on this side.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Whether the session has aged past [`REAUTH_INTERVAL`].
    pub fn needs_reauth(&self) -> bool {
        if !self.is_authenticated() {
            return true;
        }
        match *self.auth_time.lock().expect("auth_time lock poisoned") {
            Some(at) => at.elapsed() > REAUTH_INTERVAL,
            None => true,
        }
    }

    /// Drop the session: keys cleared (zeroized once the last wrap/unwrap
    /// snapshot drops), authentication reset. Idempotent.
    pub fn clear_session(&self) {
        *self.keys.write().expect("keys lock poisoned") = None;
        self.authenticated.store(false, Ordering::SeqCst);
        *self.auth_time.lock().expect("auth_time lock poisoned") = None;
    }

    fn keys_snapshot(&self) -> Result<Arc<SessionKeys>, CryptoError> {
        self.keys
            .read()
            .expect("keys lock poisoned")
            .clone()
            .ok_or(CryptoError::NoSession)
    }

    fn derive_keys(&self, salt: &[u8; SALT_SIZE]) -> SessionKeys {
        let mut aes_key = [0u8; KEY_SIZE];
        pbkdf2_hmac::<Sha256>(&self.psk, salt, PBKDF2_ITERATIONS, &mut aes_key);

        let mut hmac_salt = *salt;
        for byte in hmac_salt.iter_mut() {
            *byte ^= HMAC_SALT_MASK;
        }
        let mut hmac_key = [0u8; KEY_SIZE];
        pbkdf2_hmac::<Sha256>(&self.psk, &hmac_salt, PBKDF2_ITERATIONS, &mut hmac_key);
        hmac_salt.zeroize();

        SessionKeys { aes_key, hmac_key }
    }
}

/// Generate a 64-character alphanumeric pre-shared key.
pub fn generate_psk() -> String {
    const CHARSET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    (0..64)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect()
}

fn compute_hmac(key: &[u8; KEY_SIZE], data: &[u8]) -> [u8; HMAC_SIZE] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    let digest = mac.finalize().into_bytes();
    let mut out = [0u8; HMAC_SIZE];
    out.copy_from_slice(&digest);
    out
}

fn random_iv() -> [u8; HEADER_IV_SIZE] {
    let mut iv = [0u8; HEADER_IV_SIZE];
    rand::rng().fill_bytes(&mut iv);
    iv
}
