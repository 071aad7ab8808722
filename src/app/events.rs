//! Events published to operator-facing subscribers

use serde::{Deserialize, Serialize};

use crate::project::RequestSummary;
use crate::proxy::InterceptedView;

/// What happened to the object carried by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordAction {
    Add,
    Update,
    Delete,
}

/// Project change notifications
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "object_type")]
pub enum ProjectEvent {
    /// A request record was created or changed
    #[serde(rename = "Request")]
    Request {
        action: RecordAction,
        request: RequestSummary,
    },

    /// A new sitemap bucket was observed
    #[serde(rename = "Site Map Path")]
    SiteMapPath { action: RecordAction, path: String },

    /// An exchange was held for, or released by, the operator
    #[serde(rename = "Intercepted Request")]
    InterceptedRequest {
        action: RecordAction,
        intercepted: InterceptedView,
    },
}

impl ProjectEvent {
    /// Short label used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            ProjectEvent::Request { .. } => "request",
            ProjectEvent::SiteMapPath { .. } => "sitemap",
            ProjectEvent::InterceptedRequest { .. } => "intercept",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_object_type() {
        let event = ProjectEvent::SiteMapPath {
            action: RecordAction::Add,
            path: "https://example.com/".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["object_type"], "Site Map Path");
        assert_eq!(json["action"], "add");
        assert_eq!(event.kind(), "sitemap");
    }
}
