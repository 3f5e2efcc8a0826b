//! Context assembly: select, dedupe, order and budget the ranked items that
//! go into the prompt.

use std::collections::HashSet;

use tracing::debug;

use crate::config::{ContextOrder, ContextSettings};
use crate::core::text::{content_hash, estimate_tokens, truncate_with_ellipsis};
use crate::domain::{AssembledContext, ContextItem, ContextRole, ScoredItem, SourceKind};

#[derive(Debug, Clone)]
pub struct ContextAssembler {
    settings: ContextSettings,
}

impl ContextAssembler {
    pub fn new(settings: ContextSettings) -> Self {
        Self { settings }
    }

    /// Build the payload from a fused ranking (best first)
    pub fn assemble(&self, ranking: &[ScoredItem]) -> AssembledContext {
        let s = &self.settings;

        // Dedupe by source id and by normalized text, keeping the better rank
        let mut seen_ids: HashSet<&str> = HashSet::new();
        let mut seen_text: HashSet<String> = HashSet::new();
        let candidates: Vec<(usize, &ScoredItem)> = ranking
            .iter()
            .enumerate()
            .filter(|&(_, item)| {
                seen_ids.insert(item.source_id()) && seen_text.insert(content_hash(item.text()))
            })
            .collect();

        let mut facts: Vec<(usize, &ScoredItem)> = Vec::new();
        let mut snippets: Vec<(usize, &ScoredItem)> = Vec::new();
        let mut spare_facts = Vec::new();
        let mut spare_snippets = Vec::new();

        for (rank, item) in candidates {
            match item.kind() {
                SourceKind::Graph if facts.len() < s.max_facts => facts.push((rank, item)),
                SourceKind::Graph => spare_facts.push((rank, item)),
                SourceKind::Vector if snippets.len() < s.max_snippets => {
                    snippets.push((rank, item))
                }
                SourceKind::Vector => spare_snippets.push((rank, item)),
            }
        }

        if s.cross_modal_substitution {
            let snippet_gap = s.max_snippets.saturating_sub(snippets.len());
            let fact_gap = s.max_facts.saturating_sub(facts.len());
            let borrowed_facts: Vec<_> = spare_facts.into_iter().take(snippet_gap).collect();
            let borrowed_snippets: Vec<_> = spare_snippets.into_iter().take(fact_gap).collect();
            if !borrowed_facts.is_empty() || !borrowed_snippets.is_empty() {
                debug!(
                    borrowed_facts = borrowed_facts.len(),
                    borrowed_snippets = borrowed_snippets.len(),
                    "Cross-modal substitution"
                );
            }
            facts.extend(borrowed_facts);
            snippets.extend(borrowed_snippets);
            facts.sort_by_key(|(rank, _)| *rank);
            snippets.sort_by_key(|(rank, _)| *rank);
        }

        let to_items = |selected: Vec<(usize, &ScoredItem)>, role: ContextRole| {
            selected
                .into_iter()
                .map(|(rank, item)| self.context_item(rank, item, role))
                .collect::<Vec<_>>()
        };
        let facts = to_items(facts, ContextRole::Fact);
        let snippets = to_items(snippets, ContextRole::Snippet);

        let mut items = match s.order {
            ContextOrder::FactsFirst => [facts, snippets].concat(),
            ContextOrder::SnippetsFirst => [snippets, facts].concat(),
        };

        let estimated_tokens = self.fit_budget(&mut items);
        debug!(
            items = items.len(),
            estimated_tokens,
            budget = s.max_tokens,
            "Assembled context"
        );

        AssembledContext {
            items,
            estimated_tokens,
        }
    }

    fn context_item(&self, rank: usize, item: &ScoredItem, role: ContextRole) -> ContextItem {
        let text = truncate_with_ellipsis(item.text().trim(), self.settings.max_item_chars);
        let truncated = text.len() != item.text().trim().len();

        ContextItem {
            role,
            source: item.provenance(),
            text,
            fused_score: item.fused_score(),
            rank,
            truncated,
        }
    }

    /// Shrink the lowest-ranked item (or drop it when too short to keep)
    /// until the estimate fits. Returns the final estimate.
    fn fit_budget(&self, items: &mut Vec<ContextItem>) -> usize {
        let s = &self.settings;
        let mut total: usize = items.iter().map(|i| estimate_tokens(&i.text)).sum();

        while total > s.max_tokens {
            let Some(victim) = items
                .iter()
                .enumerate()
                .max_by_key(|(_, item)| item.rank)
                .map(|(pos, _)| pos)
            else {
                break;
            };

            let excess = total - s.max_tokens;
            let current = items[victim].text.chars().count();
            let target = current.saturating_sub(excess * 4);
            let before = estimate_tokens(&items[victim].text);

            if target >= s.min_item_chars {
                let item = &mut items[victim];
                item.text = truncate_with_ellipsis(&item.text, target);
                item.truncated = true;
                total = total - before + estimate_tokens(&item.text);
            } else {
                let removed = items.remove(victim);
                debug!(source = %removed.source.source_id, rank = removed.rank, "Dropped context item over budget");
                total -= before;
            }
        }

        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoringWeights;
    use crate::core::scoring::HybridScorer;

    fn ranking(vectors: usize, graphs: usize) -> Vec<ScoredItem> {
        let vector = (0..vectors)
            .map(|i| {
                ScoredItem::vector(
                    format!("chunk-{:02}", i),
                    format!("Passage number {} about managing exam stress", i),
                    1.0 - i as f64 * 0.01,
                )
            })
            .collect();
        let graph = (0..graphs)
            .map(|i| {
                ScoredItem::graph(
                    format!("node-{:02}", i),
                    format!("Fact {} links sleep and mood", i),
                    1.0 - i as f64 * 0.01,
                    0.5,
                )
            })
            .collect();
        HybridScorer::new(ScoringWeights::default())
            .unwrap()
            .score(vector, graph)
    }

    #[test]
    fn test_caps_and_facts_first() {
        let ctx = ContextAssembler::new(ContextSettings::default()).assemble(&ranking(20, 20));

        assert_eq!(ctx.snippets().count(), 6);
        assert_eq!(ctx.facts().count(), 12);
        assert_eq!(ctx.items[0].role, ContextRole::Fact);
        assert_eq!(ctx.items[12].role, ContextRole::Snippet);
        assert!(ctx.estimated_tokens <= 1800);
    }

    #[test]
    fn test_short_modality_without_substitution() {
        let ctx = ContextAssembler::new(ContextSettings::default()).assemble(&ranking(2, 20));
        assert_eq!(ctx.snippets().count(), 2);
        assert_eq!(ctx.facts().count(), 12);
    }

    #[test]
    fn test_cross_modal_substitution_fills_gap() {
        let settings = ContextSettings {
            cross_modal_substitution: true,
            ..Default::default()
        };
        let ctx = ContextAssembler::new(settings).assemble(&ranking(2, 20));
        assert_eq!(ctx.snippets().count(), 2);
        assert_eq!(ctx.facts().count(), 16);
        assert_eq!(ctx.len(), 18);
    }

    #[test]
    fn test_duplicate_text_is_dropped() {
        let scored = HybridScorer::new(ScoringWeights::default()).unwrap().score(
            vec![
                ScoredItem::vector("a", "Breathing  exercises help.", 0.9),
                ScoredItem::vector("b", "breathing exercises help.", 0.8),
            ],
            vec![],
        );
        let ctx = ContextAssembler::new(ContextSettings::default()).assemble(&scored);
        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx.items[0].source.source_id, "a");
    }

    #[test]
    fn test_budget_trims_lowest_ranked_first() {
        let settings = ContextSettings {
            max_tokens: 40,
            max_item_chars: 120,
            min_item_chars: 20,
            ..Default::default()
        };
        let long = "word ".repeat(40);
        let scored = HybridScorer::new(ScoringWeights::default()).unwrap().score(
            vec![
                ScoredItem::vector("best", long.clone(), 0.9),
                ScoredItem::vector("worst", format!("other {}", long), 0.1),
            ],
            vec![],
        );

        let ctx = ContextAssembler::new(settings).assemble(&scored);
        assert!(ctx.estimated_tokens <= 40);
        let best = ctx.items.iter().find(|i| i.source.source_id == "best").unwrap();
        let worst = ctx.items.iter().find(|i| i.source.source_id == "worst").unwrap();
        assert!(worst.text.chars().count() < best.text.chars().count());
        assert!(worst.truncated);
    }

    #[test]
    fn test_budget_drops_items_too_short_to_keep() {
        let settings = ContextSettings {
            max_tokens: 30,
            max_item_chars: 120,
            min_item_chars: 100,
            ..Default::default()
        };
        let long = "word ".repeat(40);
        let scored = HybridScorer::new(ScoringWeights::default()).unwrap().score(
            vec![
                ScoredItem::vector("best", long.clone(), 0.9),
                ScoredItem::vector("worst", format!("other {}", long), 0.1),
            ],
            vec![],
        );

        let ctx = ContextAssembler::new(settings).assemble(&scored);
        assert!(ctx.estimated_tokens <= 30);
        assert!(ctx.items.iter().all(|i| i.source.source_id != "worst"));
    }

    #[test]
    fn test_empty_ranking() {
        let ctx = ContextAssembler::new(ContextSettings::default()).assemble(&[]);
        assert!(ctx.is_empty());
        assert_eq!(ctx.estimated_tokens, 0);
    }
}
