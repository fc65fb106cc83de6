//! Deterministic virtual/physical channel naming (§6).
//!
//! For every virtual channel name there is a derivable physical channel
//! name. DML and Delta channels differ from each other by a known prefix
//! substitution. These are pure functions, kept next to the types they
//! operate on in the same spirit as `unique_executor_id`/`unique_operator_id`
//! in the teacher's `stream/src/task/mod.rs`.

/// The separator between a physical channel root and the per-shard suffix
/// risingwave-style vchannel names use, e.g. `rootcoord-dml_0_100v0`.
const VCHANNEL_SUFFIX_SEP: char = 'v';

/// Strips the deterministic per-virtual-channel suffix to recover the
/// physical (shared bus) channel name.
///
/// vchannel names are produced upstream as `{physical}{SEP}{shard_suffix}`;
/// a name with no separator is already physical and is returned unchanged.
pub fn physical(vchannel: &str) -> String {
    match vchannel.rfind(VCHANNEL_SUFFIX_SEP) {
        Some(idx) if vchannel[idx + 1..].chars().all(|c| c.is_ascii_digit()) && idx + 1 < vchannel.len() => {
            vchannel[..idx].to_string()
        }
        _ => vchannel.to_string(),
    }
}

/// Substitutes the configured delta-channel root prefix with the configured
/// dml-channel root prefix, pairing a delta vchannel with its DML vchannel.
/// The root prefix is a substring (e.g. `rootcoord-delta` inside
/// `by-dev-rootcoord-delta_0v7`), not necessarily the start of the name, so
/// this replaces the first occurrence rather than stripping a true prefix.
/// Returns `None` (logged by the caller, not here) if `delta_prefix` does
/// not occur in `delta_vchannel`.
pub fn dml_of(delta_vchannel: &str, delta_prefix: &str, dml_prefix: &str) -> Option<String> {
    delta_vchannel
        .find(delta_prefix)
        .map(|idx| format!("{}{}{}", &delta_vchannel[..idx], dml_prefix, &delta_vchannel[idx + delta_prefix.len()..]))
}

/// Builds the deterministic subscription name a QueryNode uses to attach as
/// a bus consumer: `subName = f(prefix, collectionID, nodeID)` (§4.2.1).
pub fn sub_name(prefix: &str, collection_id: i64, node_id: i64) -> String {
    format!("{prefix}-{collection_id}-{node_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_strips_numeric_suffix() {
        assert_eq!(physical("by-dev-rootcoord-dml_0v100"), "by-dev-rootcoord-dml_0");
        assert_eq!(physical("by-dev-rootcoord-delta_0v7"), "by-dev-rootcoord-delta_0");
    }

    #[test]
    fn physical_is_identity_without_suffix() {
        assert_eq!(physical("by-dev-rootcoord-dml_0"), "by-dev-rootcoord-dml_0");
    }

    #[test]
    fn dml_of_substitutes_prefix() {
        let got = dml_of("by-dev-rootcoord-delta_0v7", "rootcoord-delta", "rootcoord-dml");
        assert_eq!(got.as_deref(), Some("by-dev-rootcoord-dml_0v7"));
    }

    #[test]
    fn dml_of_none_on_mismatched_prefix() {
        assert_eq!(dml_of("some-other-channel", "rootcoord-delta", "rootcoord-dml"), None);
    }

    #[test]
    fn sub_name_is_deterministic() {
        assert_eq!(sub_name("qn", 100, 7), sub_name("qn", 100, 7));
        assert_ne!(sub_name("qn", 100, 7), sub_name("qn", 100, 8));
    }
}
