use crate::types::ChangeEvent;
use base64::Engine as _;
use chrono::SecondsFormat;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// The string both sides sign: `action.contentType.contentId.timestamp`.
pub fn canonical_payload(event: &ChangeEvent) -> String {
    format!(
        "{}.{}.{}.{}",
        event.action,
        event.content_type,
        event.content_id,
        event.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

/// Produce a `sha256=<hex>` signature for an event.
pub fn sign_event(secret: &str, event: &ChangeEvent) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(canonical_payload(event).as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Check a signature against the shared secret.
///
/// Accepts `sha256=<hex>` or a space separated list of `v1,<base64>`.
pub fn verify_event_signature(secret: &str, event: &ChangeEvent, signature: &str) -> bool {
    let payload = canonical_payload(event);
    let signature = signature.trim();
    if let Some(hex_sig) = signature.strip_prefix("sha256=") {
        return verify_hex_hmac(secret, payload.as_bytes(), hex_sig);
    }
    signature
        .split_whitespace()
        .filter_map(|sig| sig.strip_prefix("v1,"))
        .any(|b64| verify_base64_hmac(secret, payload.as_bytes(), b64))
}

fn verify_hex_hmac(secret: &str, payload: &[u8], expected_hex: &str) -> bool {
    let Ok(expected) = hex::decode(expected_hex) else {
        return false;
    };
    verify_bytes(secret, payload, &expected)
}

fn verify_base64_hmac(secret: &str, payload: &[u8], expected_b64: &str) -> bool {
    let Ok(expected) = base64::engine::general_purpose::STANDARD.decode(expected_b64) else {
        return false;
    };
    verify_bytes(secret, payload, &expected)
}

fn verify_bytes(secret: &str, payload: &[u8], expected: &[u8]) -> bool {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(payload);
    // Constant-time.
    mac.verify_slice(expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeAction, ContentType};

    fn event() -> ChangeEvent {
        ChangeEvent::new(ChangeAction::Publish, ContentType::Article, "A1")
    }

    #[test]
    fn hex_signature_round_trips() {
        let ev = event();
        let sig = sign_event("s3cret", &ev);
        assert!(sig.starts_with("sha256="));
        assert!(verify_event_signature("s3cret", &ev, &sig));
        assert!(!verify_event_signature("other", &ev, &sig));
    }

    #[test]
    fn signature_is_bound_to_content_id() {
        let ev = event();
        let sig = sign_event("s3cret", &ev);
        let mut tampered = ev.clone();
        tampered.content_id = "A2".into();
        assert!(!verify_event_signature("s3cret", &tampered, &sig));
    }

    #[test]
    fn standard_webhooks_list_is_accepted() {
        let ev = event();
        let mut mac = HmacSha256::new_from_slice(b"s3cret").unwrap();
        mac.update(canonical_payload(&ev).as_bytes());
        let b64 = base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes());
        let header = format!("v1,Zm9v v1,{b64}");
        assert!(verify_event_signature("s3cret", &ev, &header));
    }

    #[test]
    fn garbage_is_rejected() {
        let ev = event();
        assert!(!verify_event_signature("s3cret", &ev, "sha256=zz"));
        assert!(!verify_event_signature("s3cret", &ev, ""));
        assert!(!verify_event_signature("s3cret", &ev, "v1,!!!"));
    }
}
