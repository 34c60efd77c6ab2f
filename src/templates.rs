//! Template resources
//!
//! A template is one container (campaign) holding a parent object (ad set)
//! with a dependent child object (ad). Replicas copy the parent/child pair
//! under the same container, or the whole structure into another scope.

use bson::doc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::db::schemas::{TemplateDoc, TEMPLATE_COLLECTION};
use crate::db::{MongoClient, MongoCollection};
use crate::platform::ObjectSpec;
use crate::types::{ReplicatorError, Result};

fn default_container_link() -> String {
    "campaign_id".to_string()
}

fn default_parent_link() -> String {
    "adset_id".to_string()
}

/// A template resource structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub template_ref: String,
    /// Scope (ad account) the template lives in
    pub scope_id: String,
    /// Existing container the template's pairs hang under
    pub container_id: String,
    /// Container definition, used when deploying into another scope
    pub container: ObjectSpec,
    pub parent: ObjectSpec,
    pub child: ObjectSpec,
    /// Parent body field that holds the container id
    #[serde(default = "default_container_link")]
    pub container_link_field: String,
    /// Child body field that holds the parent id
    #[serde(default = "default_parent_link")]
    pub parent_link_field: String,
    /// Creative every replica's child references
    #[serde(default)]
    pub shared_asset_id: Option<String>,
}

impl Template {
    pub fn validate(&self) -> Result<()> {
        if self.template_ref.trim().is_empty() {
            return Err(ReplicatorError::BadRequest("templateRef is required".into()));
        }
        if self.scope_id.trim().is_empty() || self.container_id.trim().is_empty() {
            return Err(ReplicatorError::BadRequest(
                "scopeId and containerId are required".into(),
            ));
        }
        for spec in [&self.container, &self.parent, &self.child] {
            if spec.edge.trim().is_empty() {
                return Err(ReplicatorError::BadRequest("object edge is required".into()));
            }
        }
        Ok(())
    }

    /// Container body for a deploy
    pub fn container_body(&self) -> Map<String, Value> {
        self.container.body.clone()
    }

    /// Parent body for copy `copy_number`, linked to `container_id`
    pub fn parent_body(
        &self,
        container_id: &str,
        copy_number: u32,
        pixel_id: Option<&str>,
    ) -> Map<String, Value> {
        let mut body = self.parent.body.clone();
        body.insert(
            self.container_link_field.clone(),
            Value::String(container_id.to_string()),
        );
        suffix_name(&mut body, copy_number);

        if let Some(pixel_id) = pixel_id {
            let promoted = body
                .entry("promoted_object")
                .or_insert_with(|| Value::Object(Map::new()));
            match promoted {
                Value::Object(fields) => {
                    fields.insert("pixel_id".into(), Value::String(pixel_id.to_string()));
                }
                other => {
                    let mut fields = Map::new();
                    fields.insert("pixel_id".into(), Value::String(pixel_id.to_string()));
                    *other = Value::Object(fields);
                }
            }
        }
        body
    }

    /// Child body for copy `copy_number`; `parent_ref` is an id or a batch back-reference
    pub fn child_body(&self, parent_ref: &str, copy_number: u32) -> Map<String, Value> {
        let mut body = self.child.body.clone();
        body.insert(
            self.parent_link_field.clone(),
            Value::String(parent_ref.to_string()),
        );
        suffix_name(&mut body, copy_number);

        if let Some(ref asset) = self.shared_asset_id {
            let mut creative = Map::new();
            creative.insert("creative_id".into(), Value::String(asset.clone()));
            body.insert("creative".into(), Value::Object(creative));
        }
        body
    }
}

fn suffix_name(body: &mut Map<String, Value>, copy_number: u32) {
    if let Some(Value::String(name)) = body.get_mut("name") {
        *name = format!("{} - Copy {}", name, copy_number);
    }
}

/// Where templates are read from
#[async_trait::async_trait]
pub trait TemplateSource: Send + Sync {
    async fn load(&self, template_ref: &str) -> Result<Template>;

    async fn save(&self, template: Template) -> Result<()>;
}

/// Process-local templates
#[derive(Default)]
pub struct InMemoryTemplates {
    templates: DashMap<String, Template>,
}

impl InMemoryTemplates {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl TemplateSource for InMemoryTemplates {
    async fn load(&self, template_ref: &str) -> Result<Template> {
        self.templates
            .get(template_ref)
            .map(|t| t.value().clone())
            .ok_or_else(|| ReplicatorError::NotFound(format!("template {}", template_ref)))
    }

    async fn save(&self, template: Template) -> Result<()> {
        template.validate()?;
        self.templates.insert(template.template_ref.clone(), template);
        Ok(())
    }
}

/// Templates stored in MongoDB
pub struct MongoTemplates {
    collection: MongoCollection<TemplateDoc>,
}

impl MongoTemplates {
    pub async fn new(mongo: &MongoClient) -> Result<Self> {
        Ok(Self {
            collection: mongo.collection::<TemplateDoc>(TEMPLATE_COLLECTION).await?,
        })
    }
}

#[async_trait::async_trait]
impl TemplateSource for MongoTemplates {
    async fn load(&self, template_ref: &str) -> Result<Template> {
        self.collection
            .find_one(doc! { "template_ref": template_ref })
            .await?
            .map(|doc| doc.template)
            .ok_or_else(|| ReplicatorError::NotFound(format!("template {}", template_ref)))
    }

    async fn save(&self, template: Template) -> Result<()> {
        template.validate()?;
        let filter = doc! { "template_ref": &template.template_ref };
        if self.collection.find_one(filter.clone()).await?.is_some() {
            self.collection
                .replace_one(filter, TemplateDoc::new(template))
                .await?;
        } else {
            self.collection.insert_one(TemplateDoc::new(template)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;

    pub fn sample_template() -> Template {
        Template {
            template_ref: "tpl-1".into(),
            scope_id: "act_1".into(),
            container_id: "c-1".into(),
            container: ObjectSpec::new("campaigns").with_field("name", "Spring"),
            parent: ObjectSpec::new("adsets").with_field("name", "Audience A"),
            child: ObjectSpec::new("ads").with_field("name", "Ad A"),
            container_link_field: default_container_link(),
            parent_link_field: default_parent_link(),
            shared_asset_id: Some("cr-9".into()),
        }
    }

    #[test]
    fn test_parent_body_links_container_and_injects_pixel() {
        let mut template = sample_template();
        template.parent.body.insert(
            "promoted_object".into(),
            json!({"custom_event_type": "PURCHASE"}),
        );

        let body = template.parent_body("c-7", 3, Some("px-1"));
        assert_eq!(body["campaign_id"], json!("c-7"));
        assert_eq!(body["name"], json!("Audience A - Copy 3"));
        assert_eq!(body["promoted_object"]["pixel_id"], json!("px-1"));
        assert_eq!(body["promoted_object"]["custom_event_type"], json!("PURCHASE"));
    }

    #[test]
    fn test_child_body_references_shared_creative() {
        let template = sample_template();
        let first = template.child_body("{result=parent_0:$.id}", 1);
        let second = template.child_body("123", 2);

        assert_eq!(first["adset_id"], json!("{result=parent_0:$.id}"));
        assert_eq!(first["creative"], second["creative"]);
        assert_eq!(second["creative"]["creative_id"], json!("cr-9"));
    }

    #[test]
    fn test_in_memory_source() {
        let source = InMemoryTemplates::new();
        tokio_test::block_on(async {
            assert!(matches!(
                source.load("tpl-1").await,
                Err(ReplicatorError::NotFound(_))
            ));
            tokio_test::assert_ok!(source.save(sample_template()).await);
            assert_eq!(source.load("tpl-1").await.unwrap().container_id, "c-1");

            let mut broken = sample_template();
            broken.template_ref = "tpl-2".into();
            broken.container_id.clear();
            tokio_test::assert_err!(source.save(broken).await);
        });
    }
}
