use regex::{Captures, Regex};
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::retrieval::EvidenceRef;

/// `[source-id]` citation markers.
static CITATION: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\[([A-Za-z0-9][A-Za-z0-9_.:/#-]*)\]").ok());

static SPACE_BEFORE_PUNCT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[ \t]+([.,;:!?])").ok());

static MULTI_SPACE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"[ \t]{2,}").ok());

/// Answer text after citation closure.
#[derive(Debug, Clone, PartialEq)]
pub struct CitationCheck {
    pub answer: String,
    /// Cited ids with no matching evidence, in first-seen order.
    pub unresolved: Vec<String>,
}

/// Distinct cited source ids, in first-seen order.
pub fn extract_citations(text: &str) -> Vec<String> {
    let Some(re) = CITATION.as_ref() else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    re.captures_iter(text)
        .map(|c| c[1].to_string())
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Remove citations whose source is not in `evidence`.
pub fn enforce_closure(answer: &str, evidence: &[EvidenceRef]) -> CitationCheck {
    let known: HashSet<&str> = evidence.iter().map(|c| c.source_id.as_str()).collect();
    let unresolved: Vec<String> = extract_citations(answer)
        .into_iter()
        .filter(|id| !known.contains(id.as_str()))
        .collect();

    if unresolved.is_empty() {
        return CitationCheck {
            answer: answer.to_string(),
            unresolved,
        };
    }

    let stripped = match CITATION.as_ref() {
        Some(re) => re
            .replace_all(answer, |caps: &Captures| {
                if known.contains(&caps[1]) {
                    caps[0].to_string()
                } else {
                    String::new()
                }
            })
            .into_owned(),
        None => answer.to_string(),
    };

    CitationCheck {
        answer: tidy_spacing(&stripped),
        unresolved,
    }
}

/// Answer text with every citation marker removed.
pub fn strip_citations(text: &str) -> String {
    match CITATION.as_ref() {
        Some(re) => tidy_spacing(&re.replace_all(text, "")),
        None => text.to_string(),
    }
}

fn tidy_spacing(text: &str) -> String {
    let mut out = text.to_string();
    if let Some(re) = SPACE_BEFORE_PUNCT.as_ref() {
        out = re.replace_all(&out, "$1").into_owned();
    }
    if let Some(re) = MULTI_SPACE.as_ref() {
        out = re.replace_all(&out, " ").into_owned();
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::{EvidenceChunk, StrategyTag};
    use std::sync::Arc;

    fn evidence(ids: &[&str]) -> Vec<EvidenceRef> {
        ids.iter()
            .map(|id| Arc::new(EvidenceChunk::new(*id, "text", 0.5, StrategyTag::Vector)))
            .collect()
    }

    #[test]
    fn test_extract_citations_distinct_in_order() {
        assert_eq!(
            extract_citations("A [doc-2] and B [doc-1], again [doc-2]."),
            vec!["doc-2", "doc-1"]
        );
    }

    #[test]
    fn test_extract_ignores_non_citation_brackets() {
        assert!(extract_citations("an empty [] or [ spaced ] bracket").is_empty());
    }

    #[test]
    fn test_closure_keeps_known_citations() {
        let check = enforce_closure("Refunds take 30 days [refunds].", &evidence(&["refunds"]));
        assert_eq!(check.answer, "Refunds take 30 days [refunds].");
        assert!(check.unresolved.is_empty());
    }

    #[test]
    fn test_closure_strips_unknown_citations() {
        let check = enforce_closure(
            "Refunds take 30 days [refunds] [made-up]. Warranty is 2 years [ghost].",
            &evidence(&["refunds"]),
        );
        assert_eq!(
            check.answer,
            "Refunds take 30 days [refunds]. Warranty is 2 years."
        );
        assert_eq!(check.unresolved, vec!["made-up", "ghost"]);
    }

    #[test]
    fn test_strip_citations() {
        assert_eq!(strip_citations("Paris [doc-fr] is the capital."), "Paris is the capital.");
    }
}
