/// Environment-derived deployment parameters
use thiserror::Error;

/// Errors raised while reading the deployment environment
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("the environment variable {0} is not defined")]
    MissingEnv(&'static str),

    #[error("the environment variable {name} is empty")]
    EmptyEnv { name: &'static str },
}

/// Account and region the stack targets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentTarget {
    pub account: Option<String>,
    pub region: Option<String>,
}

/// Parameters every resource name and sizing decision derives from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentParams {
    pub project_name: String,
    pub env_name: String,
    pub is_prod: bool,
    pub sso_role_name: Option<String>,
    pub access_role_name: Option<String>,
    pub target: EnvironmentTarget,
}

impl EnvironmentParams {
    /// Read parameters from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read parameters through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &'static str| -> Result<String, ConfigError> {
            let value = lookup(name).ok_or(ConfigError::MissingEnv(name))?;
            if value.trim().is_empty() {
                return Err(ConfigError::EmptyEnv { name });
            }
            Ok(value.trim().to_string())
        };
        let optional = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let project_name = required("PROJECT_NAME")?;
        let env_name = required("ENV_NAME")?;

        Ok(Self {
            is_prod: env_name == "prod",
            project_name,
            env_name,
            sso_role_name: optional("SSO_ROLE_NAME"),
            access_role_name: optional("ACCESS_ROLE_NAME"),
            target: EnvironmentTarget {
                account: optional("AWS_ACCOUNT"),
                region: optional("AWS_REGION"),
            },
        })
    }

    /// Name of the EKS cluster, e.g. `shop-dev-cluster`
    pub fn cluster_name(&self) -> String {
        format!("{}-{}-cluster", self.project_name, self.env_name)
    }

    /// Name of the CloudFormation stack, e.g. `ShopDevStack`
    pub fn stack_name(&self) -> String {
        format!(
            "{}{}Stack",
            capitalize_first_letter(&self.project_name),
            capitalize_first_letter(&self.env_name)
        )
    }
}

fn capitalize_first_letter(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
pub(crate) fn test_params(env_name: &str) -> EnvironmentParams {
    EnvironmentParams {
        project_name: "shop".to_string(),
        env_name: env_name.to_string(),
        is_prod: env_name == "prod",
        sso_role_name: None,
        access_role_name: None,
        target: EnvironmentTarget {
            account: Some("123456789012".to_string()),
            region: Some("eu-west-1".to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_missing_project_name() {
        let err = EnvironmentParams::from_lookup(lookup(&[("ENV_NAME", "dev")])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnv("PROJECT_NAME")));
        assert!(err.to_string().contains("PROJECT_NAME"));
    }

    #[test]
    fn test_empty_env_name() {
        let err = EnvironmentParams::from_lookup(lookup(&[
            ("PROJECT_NAME", "shop"),
            ("ENV_NAME", "  "),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyEnv { name: "ENV_NAME" }));
    }

    #[test]
    fn test_prod_detection() {
        let params = EnvironmentParams::from_lookup(lookup(&[
            ("PROJECT_NAME", "shop"),
            ("ENV_NAME", "prod"),
            ("AWS_REGION", "eu-west-1"),
            ("SSO_ROLE_NAME", ""),
        ]))
        .unwrap();
        assert!(params.is_prod);
        assert_eq!(params.target.region.as_deref(), Some("eu-west-1"));
        assert_eq!(params.sso_role_name, None);

        let params =
            EnvironmentParams::from_lookup(lookup(&[("PROJECT_NAME", "shop"), ("ENV_NAME", "dev")]))
                .unwrap();
        assert!(!params.is_prod);
    }

    #[test]
    fn test_names() {
        let params = test_params("dev");
        assert_eq!(params.cluster_name(), "shop-dev-cluster");
        assert_eq!(params.stack_name(), "ShopDevStack");
    }
}
