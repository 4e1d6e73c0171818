//! Parameter-name reconciliation between snapshots and live models.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::run::StateDict;

/// Namespace prepended to parameter names by replicated execution.
pub const PARALLEL_PREFIX: &str = "module.";

/// Make `state` match the live execution mode.
///
/// Non-parallel runs strip one leading [`PARALLEL_PREFIX`]; parallel runs add
/// it to keys that lack it. Other keys pass through unchanged, so applying
/// the same mode twice is a no-op.
pub fn upgrade(state: StateDict, is_parallel: bool) -> StateDict {
    state
        .into_iter()
        .map(|(key, value)| {
            let key = match (is_parallel, key.strip_prefix(PARALLEL_PREFIX)) {
                (false, Some(inner)) => inner.to_string(),
                (true, None) => format!("{}{}", PARALLEL_PREFIX, key),
                _ => key,
            };
            (key, value)
        })
        .collect()
}

/// Relation between a snapshot namespace and a live-model namespace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct KeyMapping {
    /// Prefix in the pretrained snapshot
    pub source: String,
    /// Prefix in the live model
    pub target: String,
}

impl KeyMapping {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

// Accepts either a list of mappings or a `{source: target}` map.
impl<'de> Deserialize<'de> for KeyMapping {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Named { source: String, target: String },
            Pair(String, String),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Named { source, target } => Self { source, target },
            Repr::Pair(source, target) => Self { source, target },
        })
    }
}

/// `{source: target}` entries in document order.
struct OrderedPairs(Vec<(String, String)>);

impl<'de> Deserialize<'de> for OrderedPairs {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PairsVisitor;

        impl<'de> Visitor<'de> for PairsVisitor {
            type Value = OrderedPairs;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of source prefix to target prefix")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut pairs = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some(pair) = access.next_entry::<String, String>()? {
                    pairs.push(pair);
                }
                Ok(OrderedPairs(pairs))
            }
        }

        deserializer.deserialize_map(PairsVisitor)
    }
}

/// Deserialize an ordered mapping list from a sequence or a map.
///
/// Map entries keep their document order; later entries win when two
/// mappings reach the same live key.
pub(crate) fn deserialize_mappings<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<KeyMapping>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        List(Vec<KeyMapping>),
        Map(OrderedPairs),
        Null(()),
    }

    Ok(match Repr::deserialize(deserializer)? {
        Repr::List(list) => list,
        Repr::Map(OrderedPairs(pairs)) => pairs
            .into_iter()
            .map(|(source, target)| KeyMapping { source, target })
            .collect(),
        Repr::Null(()) => Vec::new(),
    })
}

/// Result of a partial load.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransplantReport {
    /// `(snapshot key, live key)` pairs that were copied
    pub copied: Vec<(String, String)>,
    /// `(snapshot key, live key)` pairs whose names matched but shapes did not
    pub skipped: Vec<(String, String)>,
}

/// Copy matching pretrained weights into `live` in place.
///
/// For each mapping, a snapshot key `k` containing `source.` and a live key
/// `j` containing `target.` match when removing those prefixes leaves the
/// same remainder. `format_key` canonicalises snapshot keys before matching.
/// Unmatched live entries keep their values.
pub fn transplant(
    snapshot: &StateDict,
    live: &mut StateDict,
    mapping: &[KeyMapping],
    format_key: impl Fn(&str) -> String,
) -> TransplantReport {
    let mut report = TransplantReport::default();

    for entry in mapping {
        let source = format!("{}.", entry.source);
        let target = format!("{}.", entry.target);

        for (attr, value) in snapshot {
            let formatted = format_key(attr);
            if !formatted.contains(&source) {
                continue;
            }
            let remainder = formatted.replace(&source, "");

            for (own_attr, own_value) in live.iter_mut() {
                if !own_attr.contains(&target) || own_attr.replace(&target, "") != remainder {
                    continue;
                }

                if own_value.shape() != value.shape() {
                    tracing::warn!(
                        from = %attr,
                        to = %own_attr,
                        "Skipping pretrained weight: shape {:?} does not fit {:?}",
                        value.shape(),
                        own_value.shape()
                    );
                    report.skipped.push((attr.clone(), own_attr.clone()));
                    continue;
                }

                tracing::debug!(from = %attr, to = %own_attr, "Copying pretrained weight");
                own_value.assign(value);
                report.copied.push((attr.clone(), own_attr.clone()));
            }
        }
    }

    report
}
