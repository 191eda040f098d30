use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const SESSION_COOKIE_NAME: &str = "rdgrab_session";

const HASH_METHOD: &str = "sha256";

type HmacSha256 = Hmac<Sha256>;

/// Produces a `sha256$<salt>$<digest>` string with a fresh random salt.
pub fn hash_password(password: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    let digest = salted_digest(&salt, password);
    format!("{HASH_METHOD}${salt}${digest}")
}

/// Checks a password against a stored hash. Malformed stored values fail
/// verification rather than erroring.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.splitn(3, '$');
    let (Some(method), Some(salt), Some(digest)) = (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    if method != HASH_METHOD {
        return false;
    }
    salted_digest(salt, password) == digest
}

fn salted_digest(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{salt}:{password}"));
    format!("{:x}", hasher.finalize())
}

pub fn sign_session_token(username: &str, secret: &str) -> String {
    let timestamp = chrono::Utc::now().timestamp().to_string();
    let data = format!("{username}:{timestamp}");

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac key init failed");
    mac.update(data.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    URL_SAFE_NO_PAD.encode(format!("{data}:{signature}").as_bytes())
}

pub fn verify_session_token(token: &str, secret: &str, max_age_seconds: i64) -> Option<String> {
    let decoded = URL_SAFE_NO_PAD.decode(token).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;

    let mut parts = decoded.rsplitn(3, ':');
    let signature = parts.next()?;
    let timestamp = parts.next()?;
    let username = parts.next()?;

    let ts = timestamp.parse::<i64>().ok()?;
    let now = chrono::Utc::now().timestamp();
    if now - ts > max_age_seconds {
        return None;
    }

    let data = format!("{username}:{timestamp}");
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(data.as_bytes());
    let expected = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    if expected == signature {
        Some(username.to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_roundtrip() {
        let stored = hash_password("ADM2024");
        assert!(stored.starts_with("sha256$"));
        assert!(verify_password("ADM2024", &stored));
        assert!(!verify_password("adm2024", &stored));
        assert!(!verify_password("", &stored));
    }

    #[test]
    fn distinct_salts_per_hash() {
        let a = hash_password("same");
        let b = hash_password("same");
        assert_ne!(a, b);
        assert!(verify_password("same", &a));
        assert!(verify_password("same", &b));
    }

    #[test]
    fn malformed_stored_hash_fails_closed() {
        assert!(!verify_password("pw", ""));
        assert!(!verify_password("pw", "sha256$missingdigest"));
        assert!(!verify_password("pw", "md5$salt$deadbeef"));
        assert!(!verify_password("pw", "not a hash at all"));
    }

    #[test]
    fn session_token_roundtrip() {
        let token = sign_session_token("admin", "secret");
        assert_eq!(
            verify_session_token(&token, "secret", 3600),
            Some("admin".to_string())
        );
    }

    #[test]
    fn session_token_rejects_wrong_secret() {
        let token = sign_session_token("admin", "secret");
        assert_eq!(verify_session_token(&token, "other", 3600), None);
    }

    #[test]
    fn session_token_expires() {
        let token = sign_session_token("admin", "secret");
        assert_eq!(verify_session_token(&token, "secret", -1), None);
    }

    #[test]
    fn session_token_rejects_tampering() {
        let token = sign_session_token("admin", "secret");
        let decoded = URL_SAFE_NO_PAD.decode(&token).unwrap();
        let forged = String::from_utf8(decoded)
            .unwrap()
            .replacen("admin", "root", 1);
        let forged = URL_SAFE_NO_PAD.encode(forged.as_bytes());
        assert_eq!(verify_session_token(&forged, "secret", 3600), None);
    }

    #[test]
    fn usernames_with_colons_survive_signing() {
        let token = sign_session_token("a:b:c", "secret");
        assert_eq!(
            verify_session_token(&token, "secret", 3600),
            Some("a:b:c".to_string())
        );
    }
}
