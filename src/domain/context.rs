//! The bounded context payload handed to the generation provider.

use serde::{Deserialize, Serialize};

use super::item::{SourceKind, SourceRef};

/// Role an item plays in the prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextRole {
    /// Graph-origin fact
    Fact,
    /// Vector-origin passage
    Snippet,
}

/// One selected item, text already truncated to fit the budget
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub role: ContextRole,
    pub source: SourceRef,
    pub text: String,
    pub fused_score: f64,
    /// Position in the fused ranking (0 = best)
    pub rank: usize,
    /// True when the text was cut to fit a budget
    pub truncated: bool,
}

impl ContextItem {
    pub fn kind(&self) -> SourceKind {
        self.source.kind
    }
}

/// Ordered, budgeted context
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssembledContext {
    pub items: Vec<ContextItem>,
    /// Estimated token count of all item texts
    pub estimated_tokens: usize,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn facts(&self) -> impl Iterator<Item = &ContextItem> {
        self.items.iter().filter(|i| i.role == ContextRole::Fact)
    }

    pub fn snippets(&self) -> impl Iterator<Item = &ContextItem> {
        self.items.iter().filter(|i| i.role == ContextRole::Snippet)
    }

    /// Render as numbered prompt sections, in payload order
    pub fn render(&self) -> String {
        if self.items.is_empty() {
            return "(no retrieved context available)".to_string();
        }

        let mut out = String::new();
        let mut current: Option<ContextRole> = None;
        for (i, item) in self.items.iter().enumerate() {
            if current != Some(item.role) {
                if current.is_some() {
                    out.push('\n');
                }
                out.push_str(match item.role {
                    ContextRole::Fact => "Known facts:\n",
                    ContextRole::Snippet => "Relevant passages:\n",
                });
                current = Some(item.role);
            }
            out.push_str(&format!("{}. {}\n", i + 1, item.text));
        }
        out
    }
}

/// Prompt sent to the generation provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub system: String,
    pub context: String,
    pub query: String,
    /// Language the answer should be written in, when the caller knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl Prompt {
    pub fn new(system: impl Into<String>, context: &AssembledContext, query: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            context: context.render(),
            query: query.into(),
            language: None,
        }
    }

    pub fn with_language(mut self, language: Option<String>) -> Self {
        self.language = language.filter(|l| !l.trim().is_empty());
        self
    }

    /// User-turn text: context block followed by the question
    pub fn user_message(&self) -> String {
        let mut message = format!("Context:\n{}\nQuestion: {}", self.context, self.query);
        if let Some(language) = &self.language {
            message.push_str(&format!("\nAnswer in {}.", language.trim()));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(role: ContextRole, kind: SourceKind, id: &str, text: &str) -> ContextItem {
        ContextItem {
            role,
            source: SourceRef {
                kind,
                source_id: id.to_string(),
            },
            text: text.to_string(),
            fused_score: 0.5,
            rank: 0,
            truncated: false,
        }
    }

    #[test]
    fn test_render_groups_sections_in_order() {
        let ctx = AssembledContext {
            items: vec![
                item(ContextRole::Fact, SourceKind::Graph, "n1", "sleep supports mood"),
                item(ContextRole::Snippet, SourceKind::Vector, "c1", "Try a short walk."),
            ],
            estimated_tokens: 10,
        };
        let rendered = ctx.render();
        assert_eq!(
            rendered,
            "Known facts:\n1. sleep supports mood\n\nRelevant passages:\n2. Try a short walk.\n"
        );
    }

    #[test]
    fn test_render_empty_context() {
        let ctx = AssembledContext::default();
        assert_eq!(ctx.render(), "(no retrieved context available)");
    }

    #[test]
    fn test_user_message_carries_language() {
        let ctx = AssembledContext::default();
        let prompt = Prompt::new("system", &ctx, "how do I rest?");
        assert_eq!(
            prompt.user_message(),
            "Context:\n(no retrieved context available)\nQuestion: how do I rest?"
        );

        let prompt = prompt.with_language(Some("Spanish".to_string()));
        assert!(prompt.user_message().ends_with("\nAnswer in Spanish."));

        let blank = Prompt::new("system", &ctx, "q").with_language(Some("  ".to_string()));
        assert_eq!(blank.language, None);
    }
}
