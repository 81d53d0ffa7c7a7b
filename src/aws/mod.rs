/// AWS CloudFormation stack lifecycle through the aws CLI
pub mod cloudformation;
pub mod models;

pub use cloudformation::CloudFormation;
