//! Client model name → model category resolution
//!
//! Claude model names are reduced to a size tier which each provider then maps
//! to its own concrete model. Names without a known keyword pass through
//! (lowercased) so a provider can opt in with an exact mapping.

use std::fmt;

/// Abstract size tier a client model name resolves to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModelCategory {
    Small,
    Middle,
    Big,
    /// Unmatched model name, lowercased
    Custom(String),
}

impl ModelCategory {
    /// Key used in a provider's `models` table
    pub fn as_str(&self) -> &str {
        match self {
            ModelCategory::Small => "small",
            ModelCategory::Middle => "middle",
            ModelCategory::Big => "big",
            ModelCategory::Custom(name) => name,
        }
    }
}

impl fmt::Display for ModelCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keywords checked in order; the first substring hit wins.
const KEYWORDS: [(&str, ModelCategory); 3] = [
    ("haiku", ModelCategory::Small),
    ("sonnet", ModelCategory::Middle),
    ("opus", ModelCategory::Big),
];

/// Resolve a client model identifier to its category.
///
/// Matching is a case-insensitive substring test. When a name contains more
/// than one keyword the one declared first (`haiku`, then `sonnet`, then
/// `opus`) wins.
pub fn resolve(model: &str) -> ModelCategory {
    let lowered = model.to_lowercase();

    KEYWORDS
        .iter()
        .find(|(keyword, _)| lowered.contains(keyword))
        .map(|(_, category)| category.clone())
        .unwrap_or(ModelCategory::Custom(lowered))
}
