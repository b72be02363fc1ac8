use uuid::Uuid;

const FNV_OFFSET_BASIS: u32 = 0x811c9dc5;
const FNV_PRIME: u32 = 0x0100_0193;
const HASH_SLICE: usize = 8;

/// Stable opaque identifier for a supervised session.
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Correlation token handed to session tooling at spawn time, unique per
/// session. Distinct from the session id so the token can be rotated without
/// renaming the session.
pub fn new_correlation_token() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn sanitize_display_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() {
        "unknown".to_string()
    } else {
        sanitized
    }
}

fn display_hash(name: &str) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for unit in name.encode_utf16() {
        hash ^= u32::from(unit);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Human-readable terminal identifier derived from an arbitrary display
/// name. Distinct inputs that sanitize to the same text still yield distinct
/// identifiers through the hash fragment.
pub fn terminal_id_for(name: &str) -> String {
    let sanitized = sanitize_display_name(name);
    let hash_hex = format!("{:08x}", display_hash(name));
    format!("session-{sanitized}~{}", &hash_hex[..HASH_SLICE])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_display_name_and_handles_empty() {
        assert_eq!(sanitize_display_name("alpha beta"), "alpha_beta");
        assert_eq!(sanitize_display_name("////"), "____");
        assert_eq!(sanitize_display_name(""), "unknown");
    }

    #[test]
    fn terminal_id_is_stable() {
        assert_eq!(terminal_id_for("alpha beta"), terminal_id_for("alpha beta"));
    }

    #[test]
    fn distinct_inputs_produce_distinct_ids_even_when_sanitized_same() {
        assert_eq!(
            sanitize_display_name("alpha beta"),
            sanitize_display_name("alpha?beta")
        );
        assert_ne!(terminal_id_for("alpha beta"), terminal_id_for("alpha?beta"));
    }

    #[test]
    fn session_ids_and_tokens_are_unique() {
        assert_ne!(new_session_id(), new_session_id());
        assert_ne!(new_correlation_token(), new_correlation_token());
    }

    #[test]
    fn correlation_token_has_no_hyphens() {
        assert!(!new_correlation_token().contains('-'));
    }
}
