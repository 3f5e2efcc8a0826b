//! Attribute answer sentences back to the context items that support them.
//!
//! Attribution is lexical: a sentence is linked to an item when enough of
//! its content terms appear in one of the item's sentences.

use std::collections::BTreeSet;

use crate::core::text::{split_sentences, terms, truncate_with_ellipsis};
use crate::domain::{AssembledContext, ClaimProvenance, ProvenanceRef};

const EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct ProvenanceExtractor {
    /// Minimum fraction of a claim's terms found in a source sentence
    pub min_overlap: f64,
    /// Minimum number of shared terms
    pub min_shared_terms: usize,
    /// Sources kept per claim, strongest first
    pub max_sources_per_claim: usize,
}

impl Default for ProvenanceExtractor {
    fn default() -> Self {
        Self {
            min_overlap: 0.2,
            min_shared_terms: 2,
            max_sources_per_claim: 3,
        }
    }
}

struct IndexedSentence<'a> {
    text: &'a str,
    terms: BTreeSet<String>,
}

impl ProvenanceExtractor {
    /// One entry per answer sentence, in answer order
    pub fn extract(&self, answer: &str, context: &AssembledContext) -> Vec<ClaimProvenance> {
        let indexed: Vec<Vec<IndexedSentence<'_>>> = context
            .items
            .iter()
            .map(|item| {
                split_sentences(&item.text)
                    .into_iter()
                    .map(|text| IndexedSentence {
                        text,
                        terms: terms(text),
                    })
                    .collect()
            })
            .collect();

        split_sentences(answer)
            .into_iter()
            .map(|claim| {
                let claim_terms = terms(claim);
                let mut sources: Vec<ProvenanceRef> = Vec::new();

                if !claim_terms.is_empty() {
                    for (item, sentences) in context.items.iter().zip(&indexed) {
                        let best = sentences
                            .iter()
                            .map(|s| (s, claim_terms.intersection(&s.terms).count()))
                            .max_by_key(|(_, shared)| *shared);

                        let Some((sentence, shared)) = best else {
                            continue;
                        };
                        let overlap = shared as f64 / claim_terms.len() as f64;
                        if shared >= self.min_shared_terms && overlap >= self.min_overlap {
                            sources.push(ProvenanceRef {
                                kind: item.source.kind,
                                source_id: item.source.source_id.clone(),
                                excerpt: truncate_with_ellipsis(sentence.text, EXCERPT_CHARS),
                                overlap,
                            });
                        }
                    }
                }

                sources.sort_by(|a, b| {
                    b.overlap
                        .total_cmp(&a.overlap)
                        .then_with(|| a.source_id.cmp(&b.source_id))
                });
                sources.truncate(self.max_sources_per_claim);

                ClaimProvenance {
                    claim: claim.to_string(),
                    sources,
                }
            })
            .collect()
    }

    /// Unique sources across all claims, keeping each source's best match
    pub fn summarize(claims: &[ClaimProvenance]) -> Vec<ProvenanceRef> {
        let mut best: Vec<ProvenanceRef> = Vec::new();

        for source in claims.iter().flat_map(|c| &c.sources) {
            match best
                .iter_mut()
                .find(|b| b.kind == source.kind && b.source_id == source.source_id)
            {
                Some(existing) if existing.overlap < source.overlap => *existing = source.clone(),
                Some(_) => {}
                None => best.push(source.clone()),
            }
        }

        best.sort_by(|a, b| {
            b.overlap
                .total_cmp(&a.overlap)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ContextItem, ContextRole, SourceKind, SourceRef};

    fn context() -> AssembledContext {
        let item = |kind, id: &str, role, text: &str| ContextItem {
            role,
            source: SourceRef {
                kind,
                source_id: id.to_string(),
            },
            text: text.to_string(),
            fused_score: 0.5,
            rank: 0,
            truncated: false,
        };
        AssembledContext {
            items: vec![
                item(
                    SourceKind::Graph,
                    "node-sleep",
                    ContextRole::Fact,
                    "Sleep deprivation worsens exam anxiety.",
                ),
                item(
                    SourceKind::Vector,
                    "chunk-7",
                    ContextRole::Snippet,
                    "Box breathing calms the nervous system. Inhale for four counts.",
                ),
            ],
            estimated_tokens: 30,
        }
    }

    #[test]
    fn test_claims_link_to_matching_sources() {
        let answer = "Try box breathing to calm your nervous system. Good luck!";
        let claims = ProvenanceExtractor::default().extract(answer, &context());

        assert_eq!(claims.len(), 2);
        assert_eq!(claims[0].sources.len(), 1);
        assert_eq!(claims[0].sources[0].source_id, "chunk-7");
        assert_eq!(
            claims[0].sources[0].excerpt,
            "Box breathing calms the nervous system."
        );
        assert!(claims[1].sources.is_empty());
    }

    #[test]
    fn test_summary_dedupes_and_orders_by_strength() {
        let answer = "Sleep deprivation makes exam anxiety worse. \
                      Box breathing helps the nervous system. \
                      Breathing exercises calm the nervous system.";
        let claims = ProvenanceExtractor::default().extract(answer, &context());
        let summary = ProvenanceExtractor::summarize(&claims);

        assert_eq!(summary.len(), 2);
        assert!(summary[0].overlap >= summary[1].overlap);
        let ids: Vec<_> = summary.iter().map(|p| p.source_id.as_str()).collect();
        assert!(ids.contains(&"node-sleep"));
        assert!(ids.contains(&"chunk-7"));
    }

    #[test]
    fn test_empty_context_yields_unattributed_claims() {
        let claims =
            ProvenanceExtractor::default().extract("Rest well tonight.", &AssembledContext::default());
        assert_eq!(claims.len(), 1);
        assert!(claims[0].sources.is_empty());
    }
}
