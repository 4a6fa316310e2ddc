use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::messaging::template::render_template;

/// One row of a bulk send.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OutgoingMessage {
    pub to: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

impl OutgoingMessage {
    /// The row's own text, or the shared template filled with its variables.
    pub fn text(&self, template: Option<&str>) -> Option<String> {
        match (&self.message, template) {
            (Some(message), _) if !message.trim().is_empty() => Some(message.clone()),
            (_, Some(template)) if !template.trim().is_empty() => {
                Some(render_template(template, &self.variables))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BulkOutcome {
    #[serde(rename_all = "camelCase")]
    Sent { message_id: String },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkRow {
    pub to: String,
    #[serde(flatten)]
    pub outcome: BulkOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkReport {
    pub sent: usize,
    pub failed: usize,
    pub results: Vec<BulkRow>,
}

impl BulkReport {
    pub fn record(&mut self, to: &str, outcome: BulkOutcome) {
        match outcome {
            BulkOutcome::Sent { .. } => self.sent += 1,
            BulkOutcome::Failed { .. } => self.failed += 1,
        }
        self.results.push(BulkRow {
            to: to.to_string(),
            outcome,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_message_wins_over_template() {
        let row = OutgoingMessage {
            to: "1".into(),
            message: Some("custom".into()),
            variables: HashMap::from([("name".to_string(), "Ana".to_string())]),
        };
        assert_eq!(row.text(Some("Hi {name}")).as_deref(), Some("custom"));

        let row = OutgoingMessage {
            message: None,
            ..row
        };
        assert_eq!(row.text(Some("Hi {name}")).as_deref(), Some("Hi Ana"));
        assert_eq!(row.text(None), None);
    }

    #[test]
    fn report_serializes_flat_rows() {
        let mut report = BulkReport::default();
        report.record(
            "1",
            BulkOutcome::Sent {
                message_id: "m1".into(),
            },
        );
        report.record(
            "2",
            BulkOutcome::Failed {
                error: "nope".into(),
            },
        );
        assert_eq!((report.sent, report.failed), (1, 1));
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            serde_json::json!({
                "sent": 1,
                "failed": 1,
                "results": [
                    {"to": "1", "status": "sent", "messageId": "m1"},
                    {"to": "2", "status": "failed", "error": "nope"}
                ]
            })
        );
    }
}
