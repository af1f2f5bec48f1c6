use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

/// Execution environment the coordinator attaches to a managed request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TestEnvironment {
    #[serde(default)]
    pub env_vars: Vec<EnvVar>,
    #[serde(default)]
    pub setup_scripts: Vec<String>,
    #[serde(default)]
    pub output_file_patterns: Vec<String>,
    #[serde(default)]
    pub output_file_upload_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestResource {
    pub name: String,
    pub url: String,
}
