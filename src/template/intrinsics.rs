/// CloudFormation intrinsic function helpers
use serde_json::{json, Value};

/// `{ "Ref": id }`
pub fn reference(logical_id: &str) -> Value {
    json!({ "Ref": logical_id })
}

/// `{ "Fn::GetAtt": [id, attribute] }`
pub fn get_att(logical_id: &str, attribute: &str) -> Value {
    json!({ "Fn::GetAtt": [logical_id, attribute] })
}

/// `{ "Fn::Sub": template }`
pub fn sub(template: &str) -> Value {
    json!({ "Fn::Sub": template })
}

/// `{ "Fn::Join": [delimiter, parts] }`
pub fn join(delimiter: &str, parts: Vec<Value>) -> Value {
    json!({ "Fn::Join": [delimiter, parts] })
}

/// The availability zone at `index` in the stack's region
pub fn select_az(index: usize) -> Value {
    json!({ "Fn::Select": [index, { "Fn::GetAZs": "" }] })
}

/// ARN of an AWS managed IAM policy
pub fn managed_policy_arn(name: &str) -> Value {
    sub(&format!("arn:${{AWS::Partition}}:iam::aws:policy/{}", name))
}

/// Build a CloudFormation logical id from free-form name parts
///
/// `["aws-load-balancer-controller", "role"]` becomes `AwsLoadBalancerControllerRole`.
pub fn logical_id<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut id = String::new();
    for part in parts {
        for word in part
            .as_ref()
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut chars = word.chars();
            if let Some(first) = chars.next() {
                id.push(first.to_ascii_uppercase());
                id.extend(chars);
            }
        }
    }
    id
}
