//! Grounded prompt construction.
//!
//! Retrieved excerpts are embedded in the prompt with citation markers
//! (`[D<n>]` for document chunks, `[W<n>]` for web results, in the order the
//! excerpts appear) and the marker table is kept alongside the prompt so the
//! finished answer's markers can be resolved back to structured citations.

use crate::retrieval::RetrievalOutcome;
use crate::types::SourceType;

use super::Citation;

/// A prompt plus the citation table its markers refer to.
#[derive(Clone, Debug)]
pub struct GroundedPrompt {
    pub prompt: String,
    pub citations: Vec<Citation>,
    /// False when retrieval found no context and the model was instructed to
    /// answer without fabricated citations.
    pub grounded: bool,
}

/// Build the completion prompt for a question and its retrieval outcome.
pub fn build_grounded_prompt(query: &str, outcome: &RetrievalOutcome) -> GroundedPrompt {
    match outcome {
        RetrievalOutcome::NoContext => GroundedPrompt {
            prompt: format!(
                "You are a research assistant. No grounding sources were found for \
                 this question. Answer from general knowledge, state clearly that no \
                 sources from the user's documents or the web were found, and do not \
                 fabricate citations.\n\nQuestion: {query}\n\nAnswer:"
            ),
            citations: Vec::new(),
            grounded: false,
        },
        RetrievalOutcome::Grounded(results) => {
            let mut citations = Vec::new();
            let mut sources = String::new();

            for (i, result) in results.document_results.iter().enumerate() {
                let marker = format!("[D{}]", i + 1);
                sources.push_str(&format!("{marker} {}\n{}\n\n", result.title, result.excerpt));
                citations.push(Citation {
                    marker,
                    source: SourceType::Document,
                    reference: result.citation_ref.clone(),
                    title: result.title.clone(),
                    excerpt: result.excerpt.clone(),
                });
            }
            for (i, result) in results.web_results.iter().enumerate() {
                let marker = format!("[W{}]", i + 1);
                sources.push_str(&format!(
                    "{marker} {} ({})\n{}\n\n",
                    result.title, result.citation_ref, result.excerpt
                ));
                citations.push(Citation {
                    marker,
                    source: SourceType::Web,
                    reference: result.citation_ref.clone(),
                    title: result.title.clone(),
                    excerpt: result.excerpt.clone(),
                });
            }

            let prompt = format!(
                "You are a research assistant. Answer the question using the numbered \
                 sources below. Cite a source inline with its marker (for example [D1] \
                 or [W2]) wherever it supports a statement. Only cite markers that \
                 exist. If the sources do not answer the question, say so.\n\n\
                 Sources:\n{sources}Question: {query}\n\nAnswer:"
            );
            GroundedPrompt {
                prompt,
                citations,
                grounded: true,
            }
        }
    }
}

/// Prompt for the best-effort follow-up suggestion step.
pub fn follow_up_prompt(query: &str, answer: &str) -> String {
    format!(
        "Given this question and answer, suggest up to three short follow-up \
         questions the user might ask next. One per line, no numbering.\n\n\
         Question: {query}\n\nAnswer: {answer}\n\nFollow-up questions:"
    )
}

/// Parse provider output into at most three cleaned follow-up questions.
pub fn parse_follow_ups(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(['-', '*', '•'])
                .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')')
                .trim()
                .to_string()
        })
        .filter(|line| !line.is_empty())
        .take(3)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::MergedResults;
    use crate::types::RetrievalResult;

    fn result(source: SourceType, citation_ref: &str) -> RetrievalResult {
        RetrievalResult {
            source,
            score: 0.8,
            title: "Title".into(),
            excerpt: "Excerpt text.".into(),
            citation_ref: citation_ref.into(),
        }
    }

    #[test]
    fn markers_follow_prompt_order() {
        let merged = MergedResults {
            document_results: vec![
                result(SourceType::Document, "doc://d1:0"),
                result(SourceType::Document, "doc://d1:1"),
            ],
            web_results: vec![result(SourceType::Web, "https://example.com/a")],
        };
        let grounded = build_grounded_prompt("why?", &RetrievalOutcome::Grounded(merged));
        assert!(grounded.grounded);
        let markers: Vec<&str> = grounded
            .citations
            .iter()
            .map(|c| c.marker.as_str())
            .collect();
        assert_eq!(markers, vec!["[D1]", "[D2]", "[W1]"]);
        assert!(grounded.prompt.contains("[D2] Title"));
        assert!(grounded.prompt.contains("why?"));
    }

    #[test]
    fn no_context_prompt_forbids_fabricated_citations() {
        let grounded = build_grounded_prompt("why?", &RetrievalOutcome::NoContext);
        assert!(!grounded.grounded);
        assert!(grounded.citations.is_empty());
        assert!(grounded.prompt.contains("do not fabricate citations"));
    }

    #[test]
    fn follow_ups_are_cleaned_and_capped() {
        let raw = "- What about X?\n2) What about Y?\n\n* What about Z?\nExtra one";
        let parsed = parse_follow_ups(raw);
        assert_eq!(
            parsed,
            vec!["What about X?", "What about Y?", "What about Z?"]
        );
    }
}
