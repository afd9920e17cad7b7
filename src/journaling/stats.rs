use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedStats {
    pub word_count: usize,
    pub char_count: usize,
}

impl DerivedStats {
    pub fn from_content(content: &str) -> Self {
        Self {
            word_count: content.split_whitespace().count(),
            char_count: content.chars().count(),
        }
    }
}
