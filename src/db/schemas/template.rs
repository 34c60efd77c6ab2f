//! Template document schema

use bson::{doc, oid::ObjectId, Document};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::templates::Template;

/// Collection name for templates
pub const TEMPLATE_COLLECTION: &str = "templates";

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TemplateDoc {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    #[serde(default)]
    pub metadata: Metadata,

    pub template_ref: String,

    pub template: Template,
}

impl TemplateDoc {
    pub fn new(template: Template) -> Self {
        Self {
            _id: None,
            metadata: Metadata::new(),
            template_ref: template.template_ref.clone(),
            template,
        }
    }
}

impl IntoIndexes for TemplateDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "template_ref": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("template_ref_unique".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for TemplateDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
