pub mod api;
pub mod client;
pub mod uploader;

pub use api::{ApiHelper, RestApiHelper};
pub use client::ClusterClient;
pub use uploader::{EventUploader, UploaderOptions};

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
