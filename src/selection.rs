//! Active ad account / pixel selection
//!
//! The account replicas are created in and the pixel injected into their
//! parents come from a fixed-priority chain of sources:
//!
//! 1. request override
//! 2. switched configuration (set by an operator at runtime)
//! 3. stored default (process configuration)
//! 4. the template's own scope
//!
//! Each field resolves independently to the first source that provides it.

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

/// Where a selected value came from, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSource {
    RequestOverride,
    SwitchedConfig,
    StoredDefault,
    TemplateScope,
}

/// Values one source offers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionOverride {
    #[serde(default)]
    pub ad_account: Option<String>,
    #[serde(default)]
    pub pixel: Option<String>,
}

impl SelectionOverride {
    fn is_empty(&self) -> bool {
        self.ad_account.is_none() && self.pixel.is_none()
    }
}

/// A resolved value and its source
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Selected {
    pub value: String,
    pub source: SelectionSource,
}

/// Result of the resolution chain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSelection {
    pub ad_account: Option<Selected>,
    pub pixel: Option<Selected>,
}

impl ActiveSelection {
    pub fn ad_account(&self) -> Option<&str> {
        self.ad_account.as_ref().map(|s| s.value.as_str())
    }

    pub fn pixel(&self) -> Option<&str> {
        self.pixel.as_ref().map(|s| s.value.as_str())
    }
}

/// Resolve each field to the highest-priority source that sets it
pub fn resolve(layers: &[(SelectionSource, &SelectionOverride)]) -> ActiveSelection {
    let mut ordered: Vec<_> = layers.iter().collect();
    ordered.sort_by_key(|(source, _)| *source);

    let pick = |field: fn(&SelectionOverride) -> Option<&String>| {
        ordered.iter().find_map(|(source, layer)| {
            field(layer)
                .filter(|v| !v.trim().is_empty())
                .map(|v| Selected {
                    value: v.clone(),
                    source: *source,
                })
        })
    };

    ActiveSelection {
        ad_account: pick(|l| l.ad_account.as_ref()),
        pixel: pick(|l| l.pixel.as_ref()),
    }
}

/// Process-wide selection state
pub struct SelectionState {
    switched: RwLock<SelectionOverride>,
    stored: SelectionOverride,
}

impl SelectionState {
    pub fn new(stored: SelectionOverride) -> Self {
        Self {
            switched: RwLock::new(SelectionOverride::default()),
            stored,
        }
    }

    /// Replace the switched configuration; an empty value clears it
    pub async fn switch(&self, selection: SelectionOverride) {
        info!(
            ad_account = ?selection.ad_account,
            pixel = ?selection.pixel,
            cleared = selection.is_empty(),
            "Active selection switched"
        );
        *self.switched.write().await = selection;
    }

    /// Resolve for one request against a template's own scope
    pub async fn resolve_for(
        &self,
        request: &SelectionOverride,
        template_scope: &str,
    ) -> ActiveSelection {
        let switched = self.switched.read().await.clone();
        let template = SelectionOverride {
            ad_account: Some(template_scope.to_string()),
            pixel: None,
        };
        resolve(&[
            (SelectionSource::TemplateScope, &template),
            (SelectionSource::StoredDefault, &self.stored),
            (SelectionSource::SwitchedConfig, &switched),
            (SelectionSource::RequestOverride, request),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(account: Option<&str>, pixel: Option<&str>) -> SelectionOverride {
        SelectionOverride {
            ad_account: account.map(String::from),
            pixel: pixel.map(String::from),
        }
    }

    #[test]
    fn test_priority_is_fixed_regardless_of_input_order() {
        let request = layer(Some("act_req"), None);
        let switched = layer(Some("act_sw"), Some("px_sw"));
        let stored = layer(Some("act_def"), Some("px_def"));

        let selection = resolve(&[
            (SelectionSource::StoredDefault, &stored),
            (SelectionSource::RequestOverride, &request),
            (SelectionSource::SwitchedConfig, &switched),
        ]);

        assert_eq!(selection.ad_account(), Some("act_req"));
        assert_eq!(
            selection.pixel.map(|p| p.source),
            Some(SelectionSource::SwitchedConfig)
        );
    }

    #[test]
    fn test_blank_values_fall_through() {
        let request = layer(Some("  "), None);
        let stored = layer(None, Some("px_def"));
        let selection = resolve(&[
            (SelectionSource::RequestOverride, &request),
            (SelectionSource::StoredDefault, &stored),
        ]);
        assert_eq!(selection.ad_account, None);
        assert_eq!(selection.pixel(), Some("px_def"));
    }

    #[tokio::test]
    async fn test_switch_and_template_fallback() {
        let state = SelectionState::new(SelectionOverride::default());
        let none = SelectionOverride::default();

        let selection = state.resolve_for(&none, "act_tpl").await;
        assert_eq!(selection.ad_account(), Some("act_tpl"));
        assert_eq!(
            selection.ad_account.map(|a| a.source),
            Some(SelectionSource::TemplateScope)
        );

        state.switch(layer(Some("act_sw"), Some("px_sw"))).await;
        let selection = state.resolve_for(&none, "act_tpl").await;
        assert_eq!(selection.ad_account(), Some("act_sw"));
        assert_eq!(selection.pixel(), Some("px_sw"));
    }
}
