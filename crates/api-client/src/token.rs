use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// Pulls the `exp` claim (epoch seconds) out of a JWT without verifying the
/// signature. The control plane verifies tokens; we only need the expiry to
/// decide when to log in again.
pub(crate) fn unverified_expiry(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("exp")?.as_i64()
}

#[cfg(test)]
pub(crate) fn make_token(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#));
    format!("{header}.{payload}.sig")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_read_from_the_payload() {
        assert_eq!(unverified_expiry(&make_token(1700000000)), Some(1700000000));
    }

    #[test]
    fn garbage_tokens_yield_none() {
        assert_eq!(unverified_expiry("not-a-jwt"), None);
        assert_eq!(unverified_expiry("a.!!!.c"), None);
        assert_eq!(unverified_expiry(""), None);
    }
}
