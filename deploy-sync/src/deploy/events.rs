//! Progress events emitted while a deploy runs.

use serde::Serialize;
use std::path::PathBuf;

/// Steps of a single-site deploy, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeployStage {
    Stopping,
    BackingUp,
    Merging,
    RestoringDates,
    Starting,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all_fields = "camelCase")]
pub enum DeployEvent {
    #[serde(rename = "deploy:stage")]
    Stage {
        site: String,
        upload_id: String,
        stage: DeployStage,
    },
    #[serde(rename = "deploy:completed")]
    Completed {
        site: String,
        upload_id: String,
        backup_file: PathBuf,
        merged: usize,
    },
    #[serde(rename = "deploy:failed")]
    Failed {
        site: String,
        upload_id: String,
        error: String,
    },
}

impl DeployEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            DeployEvent::Stage { .. } => "deploy:stage",
            DeployEvent::Completed { .. } => "deploy:completed",
            DeployEvent::Failed { .. } => "deploy:failed",
        }
    }

    pub fn site(&self) -> &str {
        match self {
            DeployEvent::Stage { site, .. }
            | DeployEvent::Completed { site, .. }
            | DeployEvent::Failed { site, .. } => site,
        }
    }
}

/// Sink for deploy events. Must not block.
pub trait DeployEvents: Send + Sync {
    fn emit(&self, event: DeployEvent);
}

/// Discards every event.
pub struct NoopEvents;

impl DeployEvents for NoopEvents {
    fn emit(&self, _event: DeployEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = DeployEvent::Stage {
            site: "shop".into(),
            upload_id: "u1".into(),
            stage: DeployStage::BackingUp,
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "deploy:stage");
        assert_eq!(json["payload"]["uploadId"], "u1");
        assert_eq!(json["payload"]["stage"], "backing-up");
        assert_eq!(event.event_type(), "deploy:stage");
        assert_eq!(event.site(), "shop");
    }
}
