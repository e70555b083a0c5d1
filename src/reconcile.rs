//! Field reconciliation.
//!
//! Three steps, in a fixed order: resolve whatever the deterministic prefill
//! rules already answered, send the rest to the LLM in a single request, and
//! fill anything still missing with nulls. Deterministic values are
//! authoritative: the model is never asked about them and can never override
//! them.

use std::collections::HashSet;

use schemars::JsonSchema;

use crate::{
    error::ExtractError,
    prelude::*,
    reasoner::{FieldReasoner, ReasoningRequest},
    session::SessionBundle,
};

/// How many regions the reasoning prompt summarizes.
const REGION_SUMMARY_COUNT: usize = 5;

/// Per-region character cap in the reasoning prompt summary.
const REGION_SUMMARY_CHARS: usize = 200;

/// Where a resolved field value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FieldSource {
    /// Matched by a deterministic prefill rule at upload time.
    Deterministic,
    /// Supplied by the LLM.
    Inferred,
}

/// One requested field with its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ExtractedField {
    /// The requested field name, verbatim.
    pub name: String,
    /// The resolved value, or `None` if nothing could be found.
    pub value: Option<String>,
    /// How the value was resolved. Absent when unresolved.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<FieldSource>,
}

/// Deduplicate requested field names, preserving first occurrence.
pub fn dedup_field_names(requested: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    requested
        .iter()
        .filter(|name| seen.insert(name.as_str()))
        .cloned()
        .collect()
}

/// Compact per-region context for the reasoning prompt: the first few
/// regions in reading order, with their kind and a snippet of their text.
pub fn region_summary(bundle: &SessionBundle) -> String {
    bundle
        .data
        .regions
        .iter()
        .take(REGION_SUMMARY_COUNT)
        .map(|region| {
            let snippet = region
                .text
                .chars()
                .take(REGION_SUMMARY_CHARS)
                .collect::<String>()
                .replace('\n', "\\n");
            format!("[{}] {}: {}", region.index, region.kind, snippet)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Resolve the requested fields against a session.
///
/// The result covers every deduplicated requested name, in request order. A
/// failed or unreachable reasoner downgrades the unresolved fields to null
/// instead of failing the call.
#[instrument(level = "debug", skip_all, fields(session = %bundle.id, requested = requested.len()))]
pub async fn reconcile_fields(
    bundle: &SessionBundle,
    requested: &[String],
    reasoner: &dyn FieldReasoner,
) -> Vec<ExtractedField> {
    let names = dedup_field_names(requested);

    let unresolved: Vec<String> = names
        .iter()
        .filter(|name| !bundle.data.prefill.contains_key(*name))
        .cloned()
        .collect();

    let inferred = if unresolved.is_empty() {
        Default::default()
    } else {
        let summary = region_summary(bundle);
        let request = ReasoningRequest {
            document_text: &bundle.data.aggregate_text,
            region_summary: &summary,
            field_names: &unresolved,
        };
        match reasoner.infer_fields(request).await {
            Ok(inferred) => inferred,
            Err(err) => {
                let err = ExtractError::ReasoningFailure(err);
                warn!(
                    "{err:#}; leaving {} field(s) unresolved",
                    unresolved.len()
                );
                Default::default()
            }
        }
    };

    names
        .into_iter()
        .map(|name| {
            if let Some(value) = bundle.data.prefill.get(&name) {
                ExtractedField {
                    name,
                    value: Some(value.clone()),
                    source: Some(FieldSource::Deterministic),
                }
            } else if let Some(value) = inferred.get(&name) {
                ExtractedField {
                    name,
                    value: Some(value.clone()),
                    source: Some(FieldSource::Inferred),
                }
            } else {
                ExtractedField {
                    name,
                    value: None,
                    source: None,
                }
            }
        })
        .collect()
}

/// View the resolved fields as a JSON mapping from name to value-or-null.
pub fn fields_as_mapping(fields: &[ExtractedField]) -> Value {
    let mut map = serde_json::Map::new();
    for field in fields {
        let value = field
            .value
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null);
        map.insert(field.name.clone(), value);
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::Mutex,
        time::Instant,
    };

    use anyhow::anyhow;
    use async_trait::async_trait;

    use super::*;
    use crate::{
        layout::{BoundingBox, RegionKind},
        session::{RegionSummary, SessionData, SessionId},
    };

    /// Reasoner that replies from a fixed table and records what was asked.
    struct StaticReasoner {
        reply: BTreeMap<String, String>,
        asked: Mutex<Vec<Vec<String>>>,
    }

    impl StaticReasoner {
        fn new(reply: &[(&str, &str)]) -> StaticReasoner {
            StaticReasoner {
                reply: reply
                    .iter()
                    .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                    .collect(),
                asked: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl FieldReasoner for StaticReasoner {
        async fn infer_fields(
            &self,
            request: ReasoningRequest<'_>,
        ) -> Result<BTreeMap<String, String>> {
            self.asked
                .lock()
                .unwrap()
                .push(request.field_names.to_vec());
            Ok(self.reply.clone())
        }
    }

    /// Reasoner standing in for an unreachable LLM.
    struct FailingReasoner;

    #[async_trait]
    impl FieldReasoner for FailingReasoner {
        async fn infer_fields(
            &self,
            _request: ReasoningRequest<'_>,
        ) -> Result<BTreeMap<String, String>> {
            Err(anyhow!("connection refused"))
        }
    }

    fn bundle_with_prefill(prefill: &[(&str, &str)]) -> SessionBundle {
        SessionBundle {
            id: SessionId::from_raw("test-session"),
            created_at: Instant::now(),
            data: SessionData {
                aggregate_text: "RFI No: 0000220949".to_owned(),
                prefill: prefill
                    .iter()
                    .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                    .collect(),
                ..SessionData::default()
            },
        }
    }

    fn requested(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| (*n).to_owned()).collect()
    }

    #[tokio::test]
    async fn prefilled_values_are_authoritative() {
        let bundle = bundle_with_prefill(&[("RFI No", "0000220949")]);
        // The model disagrees about the RFI number. It loses.
        let reasoner =
            StaticReasoner::new(&[("RFI No", "999"), ("Contractor", "ACME Ltd")]);
        let fields = reconcile_fields(
            &bundle,
            &requested(&["RFI No", "Contractor"]),
            &reasoner,
        )
        .await;

        assert_eq!(fields[0].name, "RFI No");
        assert_eq!(fields[0].value.as_deref(), Some("0000220949"));
        assert_eq!(fields[0].source, Some(FieldSource::Deterministic));
        assert_eq!(fields[1].value.as_deref(), Some("ACME Ltd"));
        assert_eq!(fields[1].source, Some(FieldSource::Inferred));

        // Only the unresolved field ever went to the model.
        let asked = reasoner.asked.lock().unwrap();
        assert_eq!(asked.as_slice(), &[requested(&["Contractor"])]);
    }

    #[tokio::test]
    async fn reasoner_failure_leaves_nulls_not_errors() {
        let bundle = bundle_with_prefill(&[("RFI No", "0000220949")]);
        let fields = reconcile_fields(
            &bundle,
            &requested(&["RFI No", "Contractor"]),
            &FailingReasoner,
        )
        .await;

        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].value.as_deref(), Some("0000220949"));
        assert_eq!(fields[1].name, "Contractor");
        assert_eq!(fields[1].value, None);
        assert_eq!(fields[1].source, None);
    }

    #[tokio::test]
    async fn duplicates_collapse_to_first_occurrence() {
        let bundle = bundle_with_prefill(&[("Date", "12/05/2024")]);
        let fields = reconcile_fields(
            &bundle,
            &requested(&["Date", "Contractor", "Date", "Contractor"]),
            &FailingReasoner,
        )
        .await;
        let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["Date", "Contractor"]);
    }

    #[tokio::test]
    async fn result_covers_exactly_the_requested_names() {
        let bundle = bundle_with_prefill(&[("RFI No", "0000220949")]);
        let reasoner = StaticReasoner::new(&[("Contractor", "ACME Ltd")]);
        let fields = reconcile_fields(
            &bundle,
            &requested(&["RFI No", "Contractor", "Inspector"]),
            &reasoner,
        )
        .await;
        let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["RFI No", "Contractor", "Inspector"]);
        assert_eq!(fields[2].value, None);
    }

    #[tokio::test]
    async fn fully_prefilled_requests_never_call_the_model() {
        let bundle = bundle_with_prefill(&[("RFI No", "0000220949")]);
        let reasoner = StaticReasoner::new(&[]);
        let fields =
            reconcile_fields(&bundle, &requested(&["RFI No"]), &reasoner).await;
        assert_eq!(fields[0].source, Some(FieldSource::Deterministic));
        assert!(reasoner.asked.lock().unwrap().is_empty());
    }

    #[test]
    fn dedup_preserves_first_occurrence_order() {
        let names = dedup_field_names(&requested(&["b", "a", "b", "c", "a"]));
        assert_eq!(names, requested(&["b", "a", "c"]));
        assert!(dedup_field_names(&[]).is_empty());
    }

    #[test]
    fn region_summary_caps_count_and_length() {
        let mut bundle = bundle_with_prefill(&[]);
        bundle.data.regions = (1..=7)
            .map(|index| RegionSummary {
                page_index: 0,
                index,
                kind: if index == 1 {
                    RegionKind::Title
                } else {
                    RegionKind::Text
                },
                bbox: BoundingBox {
                    x1: 0,
                    y1: 0,
                    x2: 10,
                    y2: 10,
                },
                text: format!("line one\nline two of region {index}"),
                chars: 30,
            })
            .collect();
        let summary = region_summary(&bundle);
        let lines: Vec<&str> = summary.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], "[1] Title: line one\\nline two of region 1");
        assert!(lines[4].starts_with("[5] Text:"));
    }

    #[test]
    fn mapping_view_uses_null_for_unresolved() {
        let fields = vec![
            ExtractedField {
                name: "RFI No".to_owned(),
                value: Some("0000220949".to_owned()),
                source: Some(FieldSource::Deterministic),
            },
            ExtractedField {
                name: "Contractor".to_owned(),
                value: None,
                source: None,
            },
        ];
        let mapping = fields_as_mapping(&fields);
        assert_eq!(mapping["RFI No"], "0000220949");
        assert_eq!(mapping["Contractor"], Value::Null);
    }
}
