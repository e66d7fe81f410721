use crate::protocol::mysql::constants::AuthPluginName;
use rand::Rng;
use sha1::{Digest, Sha1};
use sha2::Sha256;

/// Generate the 20-byte scramble sent in the initial handshake and in
/// AuthSwitchRequest packets. Values stay in the printable ASCII range the
/// way the server generates them.
pub fn gen_scramble() -> [u8; 20] {
    let mut rng = rand::thread_rng();
    let mut salt = [0u8; 20];
    for b in salt.iter_mut() {
        *b = rng.gen_range(0x21..0x7f);
    }
    salt
}

fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn sha1_concat(a: &[u8], b: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn sha256_concat(a: &[u8], b: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().into()
}

/// The token a client sends for `mysql_native_password`:
/// `SHA1(password) XOR SHA1(scramble || SHA1(SHA1(password)))`.
pub fn native_password_token(password: &[u8], scramble: &[u8]) -> [u8; 20] {
    let pw_hash = sha1(password);
    let double_hash = sha1(&pw_hash);
    let mix = sha1_concat(scramble, &double_hash);
    let mut token = pw_hash;
    for (t, m) in token.iter_mut().zip(mix.iter()) {
        *t ^= m;
    }
    token
}

/// Verify a native-password client response against the stored double hash
/// `SHA1(SHA1(password))`. The client token XOR'd with the scramble mix
/// recovers `SHA1(password)`; hashing that once more must match the store.
pub fn verify_native_password(
    stored_double_hash: &[u8; 20],
    scramble: &[u8],
    client_token: &[u8],
) -> bool {
    if client_token.len() != 20 {
        // empty token means empty password
        return client_token.is_empty() && stored_double_hash == &sha1(&sha1(b""));
    }
    let mix = sha1_concat(scramble, stored_double_hash);
    let mut candidate = [0u8; 20];
    for idx in 0..20 {
        candidate[idx] = client_token[idx] ^ mix[idx];
    }
    sha1(&candidate) == *stored_double_hash
}

/// The fast-path token of `caching_sha2_password`:
/// `SHA256(password) XOR SHA256(SHA256(SHA256(password)) || scramble)`.
pub fn caching_sha2_token(password: &[u8], scramble: &[u8]) -> [u8; 32] {
    let pw_hash = sha256(password);
    let double_hash = sha256(&pw_hash);
    let mix = sha256_concat(&double_hash, scramble);
    let mut token = pw_hash;
    for (t, m) in token.iter_mut().zip(mix.iter()) {
        *t ^= m;
    }
    token
}

pub fn verify_caching_sha2(
    stored_double_hash: &[u8; 32],
    scramble: &[u8],
    client_token: &[u8],
) -> bool {
    if client_token.len() != 32 {
        return client_token.is_empty() && stored_double_hash == &sha256(&sha256(b""));
    }
    let mut candidate = [0u8; 32];
    candidate.copy_from_slice(client_token);
    let mix = sha256_concat(stored_double_hash, scramble);
    for idx in 0..32 {
        candidate[idx] ^= mix[idx];
    }
    sha256(&candidate) == *stored_double_hash
}

/// Hash a plaintext password the way the account store keeps it for the
/// given plugin.
pub fn stored_hash(plugin: AuthPluginName, password: &[u8]) -> Vec<u8> {
    match plugin {
        AuthPluginName::AuthNativePassword => sha1(&sha1(password)).to_vec(),
        AuthPluginName::AuthCachingSha2Password => sha256(&sha256(password)).to_vec(),
        // clear password compares byte for byte
        _ => password.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_round_trip() {
        let scramble = gen_scramble();
        let token = native_password_token(b"secret", &scramble);
        let stored = stored_hash(AuthPluginName::AuthNativePassword, b"secret");
        let mut stored_arr = [0u8; 20];
        stored_arr.copy_from_slice(&stored);
        assert!(verify_native_password(&stored_arr, &scramble, &token));
        assert!(!verify_native_password(
            &stored_arr,
            &scramble,
            &native_password_token(b"wrong", &scramble)
        ));
    }

    #[test]
    fn native_empty_password() {
        let scramble = gen_scramble();
        let stored = stored_hash(AuthPluginName::AuthNativePassword, b"");
        let mut stored_arr = [0u8; 20];
        stored_arr.copy_from_slice(&stored);
        assert!(verify_native_password(&stored_arr, &scramble, &[]));
    }

    #[test]
    fn caching_sha2_round_trip() {
        let scramble = gen_scramble();
        let token = caching_sha2_token(b"secret", &scramble);
        let stored = stored_hash(AuthPluginName::AuthCachingSha2Password, b"secret");
        let mut stored_arr = [0u8; 32];
        stored_arr.copy_from_slice(&stored);
        assert!(verify_caching_sha2(&stored_arr, &scramble, &token));
        assert!(!verify_caching_sha2(
            &stored_arr,
            &scramble,
            &caching_sha2_token(b"wrong", &scramble)
        ));
    }

    #[test]
    fn scramble_is_printable() {
        let scramble = gen_scramble();
        assert!(scramble.iter().all(|b| (0x21..0x7f).contains(b)));
    }
}
