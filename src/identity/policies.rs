/// Reusable IAM policy statements
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One statement of an IAM policy document
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyStatement {
    pub effect: &'static str,
    pub action: Vec<String>,
    pub resource: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<Value>,
}

impl PolicyStatement {
    /// Allow `actions` on every resource
    pub fn allow_all<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            effect: "Allow",
            action: actions.into_iter().map(Into::into).collect(),
            resource: vec!["*".to_string()],
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: Value) -> Self {
        self.condition = Some(condition);
        self
    }
}

/// Build a policy document from statements
pub fn policy_document(statements: &[PolicyStatement]) -> Value {
    json!({
        "Version": "2012-10-17",
        "Statement": statements,
    })
}

/// Service-wide grants that can be attached to a workload identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyPreset {
    #[serde(rename = "s3")]
    S3,
    #[serde(rename = "dynamodb")]
    DynamoDb,
    #[serde(rename = "lambda")]
    Lambda,
    #[serde(rename = "bedrock")]
    Bedrock,
    #[serde(rename = "appsync")]
    AppSync,
    #[serde(rename = "transcribe")]
    Transcribe,
}

impl PolicyPreset {
    /// IAM action prefix of the service
    pub fn service(&self) -> &'static str {
        match self {
            PolicyPreset::S3 => "s3",
            PolicyPreset::DynamoDb => "dynamodb",
            PolicyPreset::Lambda => "lambda",
            PolicyPreset::Bedrock => "bedrock",
            PolicyPreset::AppSync => "appsync",
            PolicyPreset::Transcribe => "transcribe",
        }
    }

    pub fn statement(&self) -> PolicyStatement {
        PolicyStatement::allow_all([format!("{}:*", self.service())])
    }
}

/// Permissions the AWS Load Balancer Controller needs to manage ALBs and NLBs
pub fn load_balancer_controller_statements() -> Vec<PolicyStatement> {
    vec![
        PolicyStatement::allow_all([
            "iam:CreateServiceLinkedRole",
            "ec2:DescribeAccountAttributes",
            "ec2:DescribeAddresses",
            "ec2:DescribeAvailabilityZones",
            "ec2:DescribeInternetGateways",
            "ec2:DescribeVpcs",
            "ec2:DescribeSubnets",
            "ec2:DescribeSecurityGroups",
            "ec2:DescribeInstances",
            "ec2:DescribeNetworkInterfaces",
            "ec2:DescribeTags",
            "ec2:GetCoipPoolUsage",
            "ec2:DescribeCoipPools",
            "elasticloadbalancing:DescribeLoadBalancers",
            "elasticloadbalancing:DescribeLoadBalancerAttributes",
            "elasticloadbalancing:DescribeListeners",
            "elasticloadbalancing:DescribeListenerCertificates",
            "elasticloadbalancing:DescribeSSLPolicies",
            "elasticloadbalancing:DescribeRules",
            "elasticloadbalancing:DescribeTargetGroups",
            "elasticloadbalancing:DescribeTargetGroupAttributes",
            "elasticloadbalancing:DescribeTargetHealth",
            "elasticloadbalancing:DescribeTags",
        ]),
        PolicyStatement::allow_all([
            "cognito-idp:DescribeUserPoolClient",
            "acm:ListCertificates",
            "acm:DescribeCertificate",
            "iam:ListServerCertificates",
            "iam:GetServerCertificate",
            "waf-regional:GetWebACL",
            "waf-regional:GetWebACLForResource",
            "waf-regional:AssociateWebACL",
            "waf-regional:DisassociateWebACL",
            "wafv2:GetWebACL",
            "wafv2:GetWebACLForResource",
            "wafv2:AssociateWebACL",
            "wafv2:DisassociateWebACL",
            "shield:DescribeProtection",
            "shield:GetSubscriptionState",
            "shield:DescribeSubscription",
            "shield:CreateProtection",
            "shield:DeleteProtection",
        ]),
        PolicyStatement::allow_all([
            "elasticloadbalancing:CreateLoadBalancer",
            "elasticloadbalancing:CreateTargetGroup",
        ])
        .with_condition(json!({
            "StringEquals": {
                "elasticloadbalancing:CreateAction": ["CreateTargetGroup", "CreateLoadBalancer"],
            }
        })),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_names() {
        let presets: Vec<PolicyPreset> =
            serde_yaml::from_str("[s3, dynamodb, lambda, bedrock, appsync, transcribe]").unwrap();
        assert_eq!(presets.len(), 6);
        assert_eq!(presets[1], PolicyPreset::DynamoDb);
        assert_eq!(presets[4].statement().action, vec!["appsync:*"]);
        assert!(serde_yaml::from_str::<PolicyPreset>("ec2").is_err());
    }

    #[test]
    fn test_statement_serialization() {
        let doc = policy_document(&[PolicyPreset::Bedrock.statement()]);
        assert_eq!(
            doc["Statement"][0],
            json!({ "Effect": "Allow", "Action": ["bedrock:*"], "Resource": ["*"] })
        );
    }

    #[test]
    fn test_load_balancer_controller_statements() {
        let statements = load_balancer_controller_statements();
        assert_eq!(statements.len(), 3);
        assert!(statements[0].condition.is_none());
        assert!(statements[2].condition.is_some());
        assert!(statements[1]
            .action
            .iter()
            .any(|a| a == "wafv2:AssociateWebACL"));
    }
}
