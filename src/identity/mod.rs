/// IAM roles, cluster access entries and workload identities
use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::info;

pub mod policies;

pub use policies::{load_balancer_controller_statements, PolicyPreset, PolicyStatement};

use crate::cluster::CLUSTER_ID;
use crate::template::{
    get_att, logical_id, managed_policy_arn, reference, sub, Resource, Template,
};

/// EKS access policy granting full cluster administration
pub const CLUSTER_ADMIN_POLICY: &str = "AmazonEKSClusterAdminPolicy";

const SSO_ROLE_PREFIX: &str = "AWSReservedSSO_";
const SSO_ROLE_PATH: &str = "aws-reserved/sso.amazonaws.com/";

/// IAM OIDC provider trusting the cluster's service account tokens
pub const OIDC_PROVIDER_ID: &str = "EksOidcProvider";

const STS_AUDIENCE: &str = "sts.amazonaws.com";
const MAX_ROLE_NAME_LEN: usize = 64;

/// An IAM role assumable by an AWS service, with managed policies attached
pub fn service_role(service: &str, managed_policies: &[&str], tag_session: bool) -> Resource {
    let mut actions = vec!["sts:AssumeRole"];
    if tag_session {
        actions.push("sts:TagSession");
    }

    Resource::new(
        "AWS::IAM::Role",
        json!({
            "AssumeRolePolicyDocument": {
                "Version": "2012-10-17",
                "Statement": [{
                    "Effect": "Allow",
                    "Principal": { "Service": service },
                    "Action": actions,
                }],
            },
            "ManagedPolicyArns": managed_policies
                .iter()
                .map(|name| managed_policy_arn(name))
                .collect::<Vec<_>>(),
        }),
    )
}

/// Who is being granted access
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// An IAM role in the target account, by name
    IamRole(String),

    /// A Kubernetes service account
    ServiceAccount { namespace: String, name: String },
}

impl Principal {
    /// ARN of an IAM role principal; Identity Center roles live under their reserved path
    fn role_arn(name: &str) -> Value {
        let path = if name.starts_with(SSO_ROLE_PREFIX) {
            SSO_ROLE_PATH
        } else {
            ""
        };
        sub(&format!(
            "arn:${{AWS::Partition}}:iam::${{AWS::AccountId}}:role/{}{}",
            path, name
        ))
    }

    fn label(&self) -> String {
        match self {
            Principal::IamRole(name) => name.clone(),
            Principal::ServiceAccount { namespace, name } => format!("{}/{}", namespace, name),
        }
    }
}

/// What the principal may do
#[derive(Debug, Clone, PartialEq)]
pub enum Permission {
    /// A named EKS access policy, e.g. `AmazonEKSClusterAdminPolicy`
    AccessPolicy(String),

    /// An inline IAM policy
    Inline(Vec<PolicyStatement>),
}

/// How a service account obtains its role's credentials
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WorkloadIdentity {
    /// EKS Pod Identity through the node agent
    #[default]
    PodIdentity,

    /// Projected service account token exchanged via the cluster OIDC provider
    WebIdentity,
}

/// Grants a principal a permission within one cluster
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityBinding {
    pub principal: Principal,
    pub permission: Permission,
    /// Name of the cluster the grant applies to
    pub scope: String,
    pub mechanism: WorkloadIdentity,
}

impl IdentityBinding {
    pub fn new(principal: Principal, permission: Permission, scope: impl Into<String>) -> Result<Self> {
        let scope = scope.into();
        if scope.trim().is_empty() {
            anyhow::bail!("Identity binding for {} has no cluster scope", principal.label());
        }

        match (&principal, &permission) {
            (Principal::IamRole(_), Permission::AccessPolicy(_)) => {}
            (Principal::ServiceAccount { .. }, Permission::Inline(statements)) => {
                if statements.is_empty() {
                    anyhow::bail!(
                        "Identity binding for {} grants no permissions",
                        principal.label()
                    );
                }
            }
            _ => anyhow::bail!(
                "Identity binding for {}: IAM roles take access policies, service accounts take inline policies",
                principal.label()
            ),
        }

        Ok(Self {
            principal,
            permission,
            scope,
            mechanism: WorkloadIdentity::default(),
        })
    }

    /// Use an OIDC web identity instead of Pod Identity, for pods without the node agent
    pub fn with_web_identity(mut self) -> Self {
        self.mechanism = WorkloadIdentity::WebIdentity;
        self
    }

    /// Logical id and IAM name of the role a web identity binding creates
    pub fn web_identity_role(&self) -> Option<(String, String)> {
        match (&self.principal, self.mechanism) {
            (Principal::ServiceAccount { name, .. }, WorkloadIdentity::WebIdentity) => {
                let mut role_name = format!("{}-{}", self.scope, name);
                role_name.truncate(MAX_ROLE_NAME_LEN);
                let role_name = role_name.trim_end_matches('-').to_string();
                Some((logical_id([name.as_str(), "web identity role"]), role_name))
            }
            _ => None,
        }
    }

    /// Cluster administrator access for an IAM role
    pub fn cluster_admin(role_name: impl Into<String>, cluster_name: &str) -> Result<Self> {
        Self::new(
            Principal::IamRole(role_name.into()),
            Permission::AccessPolicy(CLUSTER_ADMIN_POLICY.to_string()),
            cluster_name,
        )
    }

    /// Pod Identity for a service account with inline statements
    pub fn workload(
        namespace: &str,
        service_account: &str,
        statements: Vec<PolicyStatement>,
        cluster_name: &str,
    ) -> Result<Self> {
        Self::new(
            Principal::ServiceAccount {
                namespace: namespace.to_string(),
                name: service_account.to_string(),
            },
            Permission::Inline(statements),
            cluster_name,
        )
    }

    /// Emit the binding against the cluster named `cluster_name`; returns the main logical id
    pub fn emit(&self, template: &mut Template, cluster_name: &str, cluster: &Value) -> Result<String> {
        if self.scope != cluster_name {
            anyhow::bail!(
                "Identity binding for {} is scoped to cluster {}, not {}",
                self.principal.label(),
                self.scope,
                cluster_name
            );
        }

        match (&self.principal, &self.permission) {
            (Principal::IamRole(role_name), Permission::AccessPolicy(policy)) => {
                // Names differing only in punctuation share a derived id
                let id =
                    template.unused_logical_id(&logical_id([role_name.as_str(), "access entry"]));
                info!("Granting {} to role {}", policy, role_name);
                template.add_resource(
                    id.as_str(),
                    Resource::new(
                        "AWS::EKS::AccessEntry",
                        json!({
                            "ClusterName": cluster,
                            "PrincipalArn": Principal::role_arn(role_name),
                            "Type": "STANDARD",
                            "AccessPolicies": [{
                                "PolicyArn": sub(&format!(
                                    "arn:${{AWS::Partition}}:eks::aws:cluster-access-policy/{}",
                                    policy
                                )),
                                "AccessScope": { "Type": "cluster" },
                            }],
                        }),
                    ),
                )?;
                Ok(id)
            }
            (Principal::ServiceAccount { namespace, name }, Permission::Inline(statements)) => {
                info!(
                    "Binding service account {}/{} to an IAM role ({} statements, {:?})",
                    namespace,
                    name,
                    statements.len(),
                    self.mechanism
                );
                match self.mechanism {
                    WorkloadIdentity::PodIdentity => {
                        emit_pod_identity(template, cluster, namespace, name, statements)
                    }
                    WorkloadIdentity::WebIdentity => {
                        self.emit_web_identity(template, namespace, name, statements)
                    }
                }
            }
            _ => anyhow::bail!("Unsupported identity binding for {}", self.principal.label()),
        }
    }
}

impl IdentityBinding {
    fn emit_web_identity(
        &self,
        template: &mut Template,
        namespace: &str,
        name: &str,
        statements: &[PolicyStatement],
    ) -> Result<String> {
        let (role_id, role_name) = self
            .web_identity_role()
            .context("Web identity needs a service account principal")?;

        if !template.contains(OIDC_PROVIDER_ID) {
            template.add_resource(
                OIDC_PROVIDER_ID,
                Resource::new(
                    "AWS::IAM::OIDCProvider",
                    json!({
                        "Url": get_att(CLUSTER_ID, "OpenIdConnectIssuerUrl"),
                        "ClientIdList": [STS_AUDIENCE],
                    }),
                ),
            )?;
        }

        // Condition keys embed the issuer host, so the document goes through Fn::Sub
        let trust = serde_json::to_string(&json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": { "Federated": "${Provider}" },
                "Action": "sts:AssumeRoleWithWebIdentity",
                "Condition": {
                    "StringEquals": {
                        "${Issuer}:sub": format!("system:serviceaccount:{}:{}", namespace, name),
                        "${Issuer}:aud": STS_AUDIENCE,
                    },
                },
            }],
        }))
        .context("Failed to render trust policy")?;
        let issuer_host = json!({
            "Fn::Select": [1, { "Fn::Split": ["//", get_att(CLUSTER_ID, "OpenIdConnectIssuerUrl")] }],
        });

        template.add_resource(
            role_id.as_str(),
            Resource::new(
                "AWS::IAM::Role",
                json!({
                    "RoleName": role_name,
                    "AssumeRolePolicyDocument": {
                        "Fn::Sub": [trust, {
                            "Provider": reference(OIDC_PROVIDER_ID),
                            "Issuer": issuer_host,
                        }],
                    },
                    "Policies": [{
                        "PolicyName": format!("{}-policy", name),
                        "PolicyDocument": policies::policy_document(statements),
                    }],
                }),
            ),
        )?;
        Ok(role_id)
    }
}

fn emit_pod_identity(
    template: &mut Template,
    cluster: &Value,
    namespace: &str,
    name: &str,
    statements: &[PolicyStatement],
) -> Result<String> {
    let role_id = logical_id([name, "pod identity role"]);
    let association_id = logical_id([name, "pod identity"]);

    template.add_resource(
        role_id.as_str(),
        Resource::new(
            "AWS::IAM::Role",
            json!({
                "AssumeRolePolicyDocument": {
                    "Version": "2012-10-17",
                    "Statement": [{
                        "Effect": "Allow",
                        "Principal": { "Service": "pods.eks.amazonaws.com" },
                        "Action": ["sts:AssumeRole", "sts:TagSession"],
                    }],
                },
                "Policies": [{
                    "PolicyName": format!("{}-policy", name),
                    "PolicyDocument": policies::policy_document(statements),
                }],
            }),
        ),
    )?;
    template.add_resource(
        association_id.as_str(),
        Resource::new(
            "AWS::EKS::PodIdentityAssociation",
            json!({
                "ClusterName": cluster,
                "Namespace": namespace,
                "ServiceAccount": name,
                "RoleArn": get_att(&role_id, "Arn"),
            }),
        ),
    )?;
    Ok(association_id)
}

/// Admin access entries for the operator roles named in the environment
pub fn operator_bindings(
    role_names: impl IntoIterator<Item = String>,
    cluster_name: &str,
) -> Result<Vec<IdentityBinding>> {
    let mut bindings: Vec<IdentityBinding> = Vec::new();
    for role_name in role_names {
        // IAM role names are unique regardless of case
        let duplicate = bindings.iter().any(|b| match &b.principal {
            Principal::IamRole(existing) => existing.eq_ignore_ascii_case(&role_name),
            Principal::ServiceAccount { .. } => false,
        });
        if duplicate {
            continue;
        }
        bindings.push(IdentityBinding::cluster_admin(role_name, cluster_name)?);
    }
    Ok(bindings)
}
