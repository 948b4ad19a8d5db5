use crate::error::UpdaterError;

/// Candidate download URLs for `direct_url`, in the order they should be tried.
pub fn resolve_candidates(
    use_relay: bool,
    relays: &[String],
    direct_url: &str,
) -> Result<Vec<String>, UpdaterError> {
    if direct_url.trim().is_empty() {
        return Err(UpdaterError::InvalidUrl(direct_url.to_string()));
    }

    if !use_relay || relays.is_empty() {
        return Ok(vec![direct_url.to_string()]);
    }

    Ok(relays
        .iter()
        .map(|relay| effective_url(relay, direct_url))
        .collect())
}

/// Plain concatenation, no path-aware joining.
pub fn effective_url(relay: &str, direct_url: &str) -> String {
    if relay.is_empty() {
        direct_url.to_string()
    } else {
        format!("{}{}", relay, direct_url)
    }
}

/// Short display name for a relay prefix.
pub fn relay_label(relay: &str) -> String {
    if relay.is_empty() {
        return "direct".to_string();
    }
    relay
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_string()
}
