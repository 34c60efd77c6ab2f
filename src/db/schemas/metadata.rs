//! Write timestamps shared by every stored document

use bson::DateTime;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Metadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime>,

    /// Last write, including lease heartbeats and quota window updates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime>,
}

impl Metadata {
    pub fn new() -> Self {
        let now = DateTime::now();
        Self {
            created_at: Some(now),
            updated_at: Some(now),
        }
    }

    /// Stamp a first insert
    pub fn touch_created(&mut self) {
        *self = Self::new();
    }

    /// Stamp a rewrite, keeping the creation time
    pub fn touch(&mut self) {
        let now = DateTime::now();
        self.created_at.get_or_insert(now);
        self.updated_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_touch_keeps_creation_time() {
        let created = DateTime::from_millis(1_700_000_000_000);
        let mut metadata = Metadata {
            created_at: Some(created),
            updated_at: Some(created),
        };
        metadata.touch();
        assert_eq!(metadata.created_at, Some(created));
        assert!(metadata.updated_at.is_some_and(|at| at > created));

        let mut fresh = Metadata::default();
        fresh.touch();
        assert!(fresh.created_at.is_some());
    }
}
