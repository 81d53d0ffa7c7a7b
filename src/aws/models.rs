/// CloudFormation API data models
use serde::{Deserialize, Serialize};

/// `describe-stacks` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeStacksResponse {
    #[serde(default)]
    pub stacks: Vec<StackDescription>,
}

/// A deployed stack
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StackDescription {
    pub stack_name: String,
    pub stack_status: String,
    #[serde(default)]
    pub stack_status_reason: Option<String>,
    #[serde(default)]
    pub creation_time: Option<String>,
    #[serde(default)]
    pub last_updated_time: Option<String>,
    #[serde(default)]
    pub outputs: Vec<StackOutput>,
}

/// A stack output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StackOutput {
    pub output_key: String,
    pub output_value: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// `describe-stack-events` response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescribeStackEventsResponse {
    #[serde(default)]
    pub stack_events: Vec<StackEvent>,
}

/// One resource status change
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct StackEvent {
    pub logical_resource_id: String,
    pub resource_type: String,
    pub resource_status: String,
    #[serde(default)]
    pub resource_status_reason: Option<String>,
    pub timestamp: String,
}

/// Where a stack status sits in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackPhase {
    InProgress,
    Complete,
    Failed,
    Deleted,
}

impl StackPhase {
    pub fn classify(status: &str) -> Self {
        match status {
            "DELETE_COMPLETE" => StackPhase::Deleted,
            s if s.ends_with("_IN_PROGRESS") => StackPhase::InProgress,
            s if s.ends_with("_FAILED") || s.ends_with("ROLLBACK_COMPLETE") => StackPhase::Failed,
            s if s.ends_with("_COMPLETE") => StackPhase::Complete,
            _ => StackPhase::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self != StackPhase::InProgress
    }
}

impl StackDescription {
    pub fn phase(&self) -> StackPhase {
        StackPhase::classify(&self.stack_status)
    }

    pub fn output(&self, key: &str) -> Option<&str> {
        self.outputs
            .iter()
            .find(|o| o.output_key == key)
            .map(|o| o.output_value.as_str())
    }
}

impl StackEvent {
    pub fn is_failure(&self) -> bool {
        self.resource_status.ends_with("_FAILED")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(StackPhase::classify("CREATE_COMPLETE"), StackPhase::Complete);
        assert_eq!(StackPhase::classify("UPDATE_COMPLETE"), StackPhase::Complete);
        assert_eq!(
            StackPhase::classify("UPDATE_COMPLETE_CLEANUP_IN_PROGRESS"),
            StackPhase::InProgress
        );
        assert_eq!(StackPhase::classify("ROLLBACK_COMPLETE"), StackPhase::Failed);
        assert_eq!(StackPhase::classify("UPDATE_ROLLBACK_COMPLETE"), StackPhase::Failed);
        assert_eq!(StackPhase::classify("CREATE_FAILED"), StackPhase::Failed);
        assert_eq!(StackPhase::classify("DELETE_COMPLETE"), StackPhase::Deleted);
        assert!(!StackPhase::classify("CREATE_IN_PROGRESS").is_terminal());
    }

    #[test]
    fn test_parse_describe_stacks() {
        let json = r#"{
            "Stacks": [{
                "StackId": "arn:aws:cloudformation:eu-west-1:123456789012:stack/ShopDevStack/abc",
                "StackName": "ShopDevStack",
                "StackStatus": "CREATE_COMPLETE",
                "CreationTime": "2026-01-01T00:00:00Z",
                "Outputs": [
                    { "OutputKey": "ClusterName", "OutputValue": "shop-dev-cluster", "Description": "EKS Cluster Name" }
                ]
            }]
        }"#;
        let response: DescribeStacksResponse = serde_json::from_str(json).unwrap();
        let stack = &response.stacks[0];
        assert_eq!(stack.phase(), StackPhase::Complete);
        assert_eq!(stack.output("ClusterName"), Some("shop-dev-cluster"));
        assert_eq!(stack.output("Missing"), None);
    }
}
