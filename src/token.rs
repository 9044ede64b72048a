//! Demo coordinator - session token minter
//!
//! Issues the opaque bearer tokens consumed by the reverse proxy's auth
//! sub-requests. Tokens encode `id:unixMillis` for offline debuggability,
//! but validation only ever consults the coordinator's token maps; the
//! payload is not trusted.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Mint a bearer token over the given id (a client id before promotion, a
/// session id after): base64 of `id:unixMillis`, a dot, and a hex
/// HMAC-SHA-256 of the pre-encoded payload under the process-wide secret.
pub fn mint(id: &str, secret: &str) -> String {
    mint_at(id, secret, chrono::Utc::now().timestamp_millis())
}

fn mint_at(id: &str, secret: &str, unix_millis: i64) -> String {
    let payload = format!("{}:{}", id, unix_millis);
    let encoded = URL_SAFE_NO_PAD.encode(payload.as_bytes());

    // HMAC accepts keys of any length; new_from_slice cannot fail here.
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("any key length is valid");
    mac.update(payload.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    format!("{}.{}", encoded, signature)
}
