//! Deterministic field prefill.
//!
//! A handful of fields on these forms follow patterns tight enough that a
//! regex is more reliable than an LLM: RFI numbers keep their leading zeros,
//! structure ids look like `CH211`, span ids look like `P17-P18`. We extract
//! those up front, once per upload, and the reconciliation step treats them
//! as authoritative.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

/// Canonical name for the date field.
pub const FIELD_DATE: &str = "Date";
/// Canonical name for the RFI number field.
pub const FIELD_RFI_NO: &str = "RFI No";
/// Canonical name for the structure id field.
pub const FIELD_STRUCTURE_ID: &str = "Structure ID";
/// Canonical name for the span id field.
pub const FIELD_SPAN_ID: &str = "Span ID";

/// A date with any of the separators that show up on scanned forms.
static DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,2}[/.\-\s]\d{1,2}[/.\-\s]\d{2,4})\b")
        .expect("failed to compile regex")
});

/// A labelled RFI number, e.g. `RFI No: 0000220949`.
static RFI_LABELLED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)RFI\s*No[:\s-]*([A-Za-z0-9\-/]+)")
        .expect("failed to compile regex")
});

/// A structure id, e.g. `CH211` or `CH 211`.
static STRUCTURE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bCH\s*\d{1,5}\b").expect("failed to compile regex")
});

/// A span id, e.g. `P17-P18`.
static SPAN_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bP\d{1,3}-P\d{1,3}\b").expect("failed to compile regex")
});

/// A zero-padded numeric run, used as an unlabelled RFI number.
static RFI_ZERO_PADDED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b0{3,}\d{4,10}\b").expect("failed to compile regex"));

/// Extract the deterministic fields from cleaned OCR text.
///
/// Rules run in a fixed order and the first match for a field wins; later
/// rules never overwrite an earlier value. Fields with no match are simply
/// absent, and a present field always has a non-empty value. The function is
/// pure: the same text always produces the same mapping.
pub fn extract_prefill(text: &str) -> BTreeMap<String, String> {
    let mut found = BTreeMap::new();
    if text.is_empty() {
        return found;
    }

    if let Some(caps) = DATE.captures(text) {
        insert_if_nonempty(&mut found, FIELD_DATE, caps[1].trim());
    }
    if let Some(caps) = RFI_LABELLED.captures(text) {
        insert_if_nonempty(&mut found, FIELD_RFI_NO, caps[1].trim());
    }
    if let Some(m) = STRUCTURE_ID.find(text) {
        // The OCR engine likes to split "CH211" across a space.
        insert_if_nonempty(&mut found, FIELD_STRUCTURE_ID, &m.as_str().replace(' ', ""));
    }
    if let Some(m) = SPAN_ID.find(text) {
        insert_if_nonempty(&mut found, FIELD_SPAN_ID, m.as_str().trim());
    }
    // A bare zero-padded run is an RFI number, but only when no labelled
    // RFI number was found above.
    if !found.contains_key(FIELD_RFI_NO) {
        if let Some(m) = RFI_ZERO_PADDED.find(text) {
            insert_if_nonempty(&mut found, FIELD_RFI_NO, m.as_str().trim());
        }
    }

    found
}

fn insert_if_nonempty(found: &mut BTreeMap<String, String>, field: &str, value: &str) {
    if !value.is_empty() && !found.contains_key(field) {
        found.insert(field.to_owned(), value.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labelled_rfi_number_is_extracted_alone() {
        let prefill = extract_prefill("RFI No: 0000220949");
        assert_eq!(prefill.len(), 1);
        assert_eq!(prefill[FIELD_RFI_NO], "0000220949");
    }

    #[test]
    fn extraction_is_idempotent() {
        let text = "RFI No: 0000220949\nCH 211 P17-P18\nInstalled 12/05/2024";
        assert_eq!(extract_prefill(text), extract_prefill(text));
    }

    #[test]
    fn all_rules_fire_on_a_full_header() {
        let text = "RFI No: 0000220949\nCH 211 P17-P18\nInstalled 12/05/2024";
        let prefill = extract_prefill(text);
        assert_eq!(prefill[FIELD_RFI_NO], "0000220949");
        assert_eq!(prefill[FIELD_STRUCTURE_ID], "CH211");
        assert_eq!(prefill[FIELD_SPAN_ID], "P17-P18");
        assert_eq!(prefill[FIELD_DATE], "12/05/2024");
    }

    #[test]
    fn labelled_rfi_wins_over_zero_padded_run() {
        let text = "RFI No: AB-12 ref 0000445566";
        let prefill = extract_prefill(text);
        assert_eq!(prefill[FIELD_RFI_NO], "AB-12");
    }

    #[test]
    fn zero_padded_run_is_a_fallback_rfi() {
        let prefill = extract_prefill("reference 0000445566 attached");
        assert_eq!(prefill[FIELD_RFI_NO], "0000445566");
    }

    #[test]
    fn first_date_wins() {
        let prefill = extract_prefill("signed 12/05/2024, revised 01/01/2025");
        assert_eq!(prefill[FIELD_DATE], "12/05/2024");
    }

    #[test]
    fn unmatched_fields_are_absent() {
        assert!(extract_prefill("").is_empty());
        assert!(extract_prefill("no identifiers here").is_empty());
    }

    #[test]
    fn structure_id_spaces_are_stripped() {
        let prefill = extract_prefill("structure CH 42 inspected");
        assert_eq!(prefill[FIELD_STRUCTURE_ID], "CH42");
    }
}
