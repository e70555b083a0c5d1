//! OCR text cleanup.
//!
//! OCR output from scanned forms is full of predictable misreads: `O` for
//! `0` in front of identifiers, `I` for `1`, glued span ids, bracket noise
//! from hole punches. We fix the predictable ones conservatively, normalize
//! whitespace without flattening the line structure, and leave everything
//! else alone. Region markers (`[REGION:...]`) must survive cleanup exactly,
//! since the prefill rules and the reasoning prompt both key off them.

use std::sync::LazyLock;

use regex::Regex;

/// Matches a region marker emitted by the upload pipeline.
static MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[REGION:[^\]]+\]").expect("failed to compile regex")
});

/// Matches a stashed region marker placeholder.
static MARKER_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"__REGION_(\d+)__").expect("failed to compile regex")
});

/// Word-boundary misread corrections, applied in order.
///
/// These fire only in narrow contexts (leading position, exact shapes), so a
/// legitimate `O` or `I` inside a word is never touched.
static OCR_CORRECTIONS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        // Letter O read in place of a leading zero: "O1" -> "01".
        (r"\bO(\d)", "0${1}"),
        // Letter I read in place of a leading one.
        (r"\bI(\d)", "1${1}"),
        (r"\b0I\b", "01"),
        // Span ids with the separator dropped: "P16017" -> "P16-P17".
        (r"\bP(\d{2})0(\d{2})\b", "P${1}-P${2}"),
        // Stray backslash-l artifacts from table rules.
        (r"\\[lI]\b", "1"),
        // Runs of brackets and o's are usually a smeared zero.
        (r"[\[\]oO]{3,}", "0"),
    ]
    .into_iter()
    .map(|(pattern, repl)| {
        (Regex::new(pattern).expect("failed to compile regex"), repl)
    })
    .collect()
});

/// Collapses bursts of blank lines down to a single blank line.
static NEWLINE_BURSTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("failed to compile regex"));

/// Collapses runs of whitespace within a single line.
static INNER_WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("failed to compile regex"));

/// Characters we do not keep: anything outside word characters, whitespace,
/// and the punctuation needed for layout and engineering notation.
static ILLEGAL_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^\w\s.\-/@:,%()#&\[\]|]").expect("failed to compile regex")
});

/// A date written with mixed separators, e.g. `12.05-2024`.
static MIXED_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(\d{1,2})[./\-](\d{1,2})[./\-](\d{2,4})\b")
        .expect("failed to compile regex")
});

/// Runs of three or more spaces, collapsed by [`pre_clean`].
static WIDE_GAPS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s{3,}").expect("failed to compile regex"));

/// Stray carriage returns.
static CARRIAGE_RETURNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\r+").expect("failed to compile regex"));

/// Clean raw OCR output.
///
/// Region markers are stashed behind placeholders for the duration of the
/// cleanup, so none of the correction or filtering passes can damage them.
pub fn clean_ocr_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }

    // Stash region markers.
    let mut markers = Vec::new();
    let mut text = MARKER
        .replace_all(text, |caps: &regex::Captures<'_>| {
            markers.push(caps[0].to_owned());
            format!("__REGION_{}__", markers.len() - 1)
        })
        .into_owned();

    // Misread corrections.
    for (pattern, repl) in OCR_CORRECTIONS.iter() {
        text = pattern.replace_all(&text, *repl).into_owned();
    }

    // Whitespace normalization, line by line so layout survives.
    let text = NEWLINE_BURSTS.replace_all(&text, "\n\n");
    let text = text
        .split('\n')
        .map(|line| INNER_WHITESPACE.replace_all(line, " ").trim().to_owned())
        .collect::<Vec<_>>()
        .join("\n");

    // Drop characters that are never meaningful on these forms.
    let text = ILLEGAL_CHARS.replace_all(&text, " ");

    // Restore region markers. A placeholder-shaped token that was already in
    // the source text has no stashed marker behind it and passes through
    // unchanged.
    let text = MARKER_PLACEHOLDER.replace_all(&text, |caps: &regex::Captures<'_>| {
        caps[1]
            .parse::<usize>()
            .ok()
            .and_then(|idx| markers.get(idx))
            .cloned()
            .unwrap_or_else(|| caps[0].to_owned())
    });

    // Normalize date separators so the prefill rules see one format.
    MIXED_DATE
        .replace_all(&text, "${1}/${2}/${3}")
        .trim()
        .to_owned()
}

/// Final whitespace pass applied just before prefill extraction.
pub fn pre_clean(text: &str) -> String {
    let text = CARRIAGE_RETURNS.replace_all(text, "");
    let text = NEWLINE_BURSTS.replace_all(&text, "\n\n");
    WIDE_GAPS.replace_all(&text, "  ").trim().to_owned()
}
