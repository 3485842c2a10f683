//! Citation marker extraction from finished answer text.

use regex::Regex;
use rustc_hash::FxHashSet;

use super::Citation;

/// Extract the citations an answer actually references, in order of first
/// occurrence, resolved against the prompt's marker table. Markers that do
/// not exist in the table (a model hallucination) are ignored.
pub fn extract_citations(answer: &str, table: &[Citation]) -> Vec<Citation> {
    let marker_pattern = Regex::new(r"\[([DW]\d+)\]").expect("citation marker pattern is valid");
    let mut seen: FxHashSet<String> = FxHashSet::default();
    let mut cited = Vec::new();

    for found in marker_pattern.find_iter(answer) {
        let marker = found.as_str();
        if !seen.insert(marker.to_string()) {
            continue;
        }
        if let Some(citation) = table.iter().find(|c| c.marker == marker) {
            cited.push(citation.clone());
        } else {
            tracing::debug!(marker, "answer cited a marker not present in the prompt");
        }
    }
    cited
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SourceType;

    fn citation(marker: &str, source: SourceType) -> Citation {
        Citation {
            marker: marker.into(),
            source,
            reference: format!("ref-{marker}"),
            title: "t".into(),
            excerpt: "e".into(),
        }
    }

    fn table() -> Vec<Citation> {
        vec![
            citation("[D1]", SourceType::Document),
            citation("[D2]", SourceType::Document),
            citation("[W1]", SourceType::Web),
        ]
    }

    #[test]
    fn extraction_preserves_first_occurrence_order() {
        let answer = "Per [W1], rust is fast [D2]. Also [W1] again, and [D1].";
        let cited = extract_citations(answer, &table());
        let markers: Vec<&str> = cited.iter().map(|c| c.marker.as_str()).collect();
        assert_eq!(markers, vec!["[W1]", "[D2]", "[D1]"]);
    }

    #[test]
    fn hallucinated_markers_are_dropped() {
        let cited = extract_citations("See [D9] and [D1].", &table());
        assert_eq!(cited.len(), 1);
        assert_eq!(cited[0].marker, "[D1]");
    }

    #[test]
    fn answer_without_markers_yields_no_citations() {
        assert!(extract_citations("plain text answer", &table()).is_empty());
    }
}
