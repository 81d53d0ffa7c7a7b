/// CloudFormation template model
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub mod intrinsics;

pub use intrinsics::{get_att, join, logical_id, managed_policy_arn, reference, select_az, sub};

/// Resource types whose `Tags` property is a list of `{Key, Value}`
const TAG_LIST_TYPES: &[&str] = &[
    "AWS::EC2::VPC",
    "AWS::EC2::Subnet",
    "AWS::EC2::InternetGateway",
    "AWS::EC2::RouteTable",
    "AWS::EC2::NatGateway",
    "AWS::EC2::EIP",
    "AWS::EC2::SecurityGroup",
    "AWS::EC2::KeyPair",
    "AWS::IAM::Role",
    "AWS::EKS::Cluster",
    "AWS::EKS::FargateProfile",
    "AWS::EKS::Addon",
    "AWS::EKS::AccessEntry",
    "AWS::EKS::PodIdentityAssociation",
];

/// Resource types whose `Tags` property is a string map
const TAG_MAP_TYPES: &[&str] = &["AWS::EKS::Nodegroup"];

/// A single template resource
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Resource {
    #[serde(rename = "Type")]
    pub resource_type: String,

    #[serde(skip_serializing_if = "Value::is_null")]
    pub properties: Value,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl Resource {
    pub fn new(resource_type: impl Into<String>, properties: Value) -> Self {
        Self {
            resource_type: resource_type.into(),
            properties,
            depends_on: vec![],
        }
    }

    /// Add an explicit ordering dependency
    pub fn depends_on(mut self, logical_id: impl Into<String>) -> Self {
        let logical_id = logical_id.into();
        if !self.depends_on.contains(&logical_id) {
            self.depends_on.push(logical_id);
        }
        self
    }

    /// Look up a property by its top-level name
    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    fn apply_tags(&mut self, tags: &BTreeMap<String, String>) {
        let list_style = TAG_LIST_TYPES.contains(&self.resource_type.as_str());
        let map_style = TAG_MAP_TYPES.contains(&self.resource_type.as_str());
        if !list_style && !map_style {
            return;
        }

        let Some(properties) = self.properties.as_object_mut() else {
            return;
        };

        if map_style {
            let existing = properties
                .entry("Tags")
                .or_insert_with(|| Value::Object(Default::default()));
            if let Some(map) = existing.as_object_mut() {
                for (key, value) in tags {
                    map.entry(key.clone()).or_insert_with(|| json!(value));
                }
            }
            return;
        }

        let existing = properties
            .entry("Tags")
            .or_insert_with(|| Value::Array(vec![]));
        if let Some(list) = existing.as_array_mut() {
            for (key, value) in tags {
                let present = list
                    .iter()
                    .any(|tag| tag.get("Key").and_then(Value::as_str) == Some(key.as_str()));
                if !present {
                    list.push(json!({ "Key": key, "Value": value }));
                }
            }
        }
    }
}

/// A stack output shown to the operator after deployment
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Output {
    pub value: Value,
    pub description: String,
}

/// An in-memory CloudFormation template
#[derive(Debug, Clone, Serialize)]
pub struct Template {
    #[serde(rename = "AWSTemplateFormatVersion")]
    format_version: &'static str,

    #[serde(rename = "Description")]
    description: String,

    #[serde(rename = "Metadata")]
    metadata: Value,

    #[serde(rename = "Resources")]
    resources: BTreeMap<String, Resource>,

    #[serde(rename = "Outputs", skip_serializing_if = "BTreeMap::is_empty")]
    outputs: BTreeMap<String, Output>,
}

impl Template {
    /// Create an empty template
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            format_version: "2010-09-09",
            description: description.into(),
            metadata: json!({
                "Generator": format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
                "GeneratedAt": chrono::Utc::now().to_rfc3339(),
            }),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    /// Add a resource; logical ids must be unique
    pub fn add_resource(&mut self, logical_id: impl Into<String>, resource: Resource) -> Result<()> {
        let logical_id = logical_id.into();
        if self.contains(&logical_id) {
            anyhow::bail!("Duplicate logical id in template: {}", logical_id);
        }
        debug!("Adding {} ({})", logical_id, resource.resource_type);
        self.resources.insert(logical_id, resource);
        Ok(())
    }

    /// Add an output; output names must be unique
    pub fn add_output(
        &mut self,
        name: impl Into<String>,
        value: Value,
        description: impl Into<String>,
    ) -> Result<()> {
        let name = name.into();
        if self.outputs.contains_key(&name) {
            anyhow::bail!("Duplicate output in template: {}", name);
        }
        self.outputs.insert(
            name,
            Output {
                value,
                description: description.into(),
            },
        );
        Ok(())
    }

    pub fn resource(&self, logical_id: &str) -> Option<&Resource> {
        self.resources.get(logical_id)
    }

    pub fn contains(&self, logical_id: &str) -> bool {
        self.resources.contains_key(logical_id)
    }

    /// `base`, or `base` with the smallest numeric suffix from 2 that is still free
    pub fn unused_logical_id(&self, base: &str) -> String {
        if !self.contains(base) {
            return base.to_string();
        }
        (2..)
            .map(|n| format!("{}{}", base, n))
            .find(|id| !self.contains(id))
            .unwrap_or_else(|| base.to_string())
    }

    pub fn output(&self, name: &str) -> Option<&Output> {
        self.outputs.get(name)
    }

    pub fn outputs(&self) -> impl Iterator<Item = (&String, &Output)> {
        self.outputs.iter()
    }

    /// All resources of the given type, keyed by logical id
    #[cfg(test)]
    pub fn resources_of_type<'a>(
        &'a self,
        resource_type: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Resource)> + 'a {
        self.resources
            .iter()
            .filter(move |(_, r)| r.resource_type == resource_type)
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    /// Tag every taggable resource without overriding tags it already carries
    pub fn apply_tags(&mut self, tags: &BTreeMap<String, String>) {
        for resource in self.resources.values_mut() {
            resource.apply_tags(tags);
        }
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize template")
    }

    /// Write the template as `<dir>/<stack_name>.template.json`
    pub async fn write_to(&self, dir: &Path, stack_name: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(dir)
            .await
            .context("Failed to create output directory")?;

        let path = dir.join(format!("{}.template.json", stack_name));
        tokio::fs::write(&path, self.to_json_pretty()?)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        info!(
            "Template written: {} ({} resources, {} outputs)",
            path.display(),
            self.resources.len(),
            self.outputs.len()
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags() -> BTreeMap<String, String> {
        [
            ("Project".to_string(), "shop".to_string()),
            ("Name".to_string(), "ignored".to_string()),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_duplicate_logical_id() {
        let mut template = Template::new("test");
        template
            .add_resource("Vpc", Resource::new("AWS::EC2::VPC", json!({})))
            .unwrap();
        assert!(template
            .add_resource("Vpc", Resource::new("AWS::EC2::VPC", json!({})))
            .is_err());
    }

    #[test]
    fn test_unused_logical_id() {
        let mut template = Template::new("test");
        assert_eq!(template.unused_logical_id("Entry"), "Entry");
        template
            .add_resource("Entry", Resource::new("AWS::EKS::AccessEntry", json!({})))
            .unwrap();
        template
            .add_resource("Entry2", Resource::new("AWS::EKS::AccessEntry", json!({})))
            .unwrap();
        assert_eq!(template.unused_logical_id("Entry"), "Entry3");
    }

    #[test]
    fn test_tags_do_not_override() {
        let mut template = Template::new("test");
        template
            .add_resource(
                "Vpc",
                Resource::new(
                    "AWS::EC2::VPC",
                    json!({ "Tags": [{ "Key": "Name", "Value": "shop-vpc" }] }),
                ),
            )
            .unwrap();
        template
            .add_resource("Nodes", Resource::new("AWS::EKS::Nodegroup", json!({})))
            .unwrap();
        template
            .add_resource(
                "Rule",
                Resource::new("AWS::EC2::SecurityGroupIngress", json!({ "IpProtocol": "-1" })),
            )
            .unwrap();

        template.apply_tags(&tags());

        let vpc_tags = template.resource("Vpc").unwrap().property("Tags").unwrap();
        assert_eq!(
            vpc_tags,
            &json!([
                { "Key": "Name", "Value": "shop-vpc" },
                { "Key": "Project", "Value": "shop" }
            ])
        );

        let nodegroup_tags = template.resource("Nodes").unwrap().property("Tags").unwrap();
        assert_eq!(nodegroup_tags["Project"], "shop");

        assert!(template.resource("Rule").unwrap().property("Tags").is_none());
    }

    #[test]
    fn test_serialized_shape() {
        let mut template = Template::new("test stack");
        template
            .add_resource(
                "Role",
                Resource::new("AWS::IAM::Role", json!({ "RoleName": "r" })).depends_on("Vpc"),
            )
            .unwrap();
        template
            .add_output("RoleArn", get_att("Role", "Arn"), "Role ARN")
            .unwrap();

        let value: Value = serde_json::from_str(&template.to_json_pretty().unwrap()).unwrap();
        assert_eq!(value["AWSTemplateFormatVersion"], "2010-09-09");
        assert_eq!(value["Resources"]["Role"]["Type"], "AWS::IAM::Role");
        assert_eq!(value["Resources"]["Role"]["DependsOn"], json!(["Vpc"]));
        assert_eq!(
            value["Outputs"]["RoleArn"]["Value"],
            json!({ "Fn::GetAtt": ["Role", "Arn"] })
        );
    }
}
