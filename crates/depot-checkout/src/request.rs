//! Checkout request model, as sent by clients in JSON.

use depot_cas::BlobKey;
use serde::{Deserialize, Serialize};

/// A named set of files to materialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    /// Requested checkout ID, relative to the checkout root.
    pub checkout_path: String,
    pub files: Vec<FileSpec>,
}

/// One file in a checkout: blob identity plus where it goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    pub sha: String,
    pub size: u64,
    /// Path inside the checkout.
    pub path: String,
}

impl FileSpec {
    pub fn new(key: &BlobKey, path: impl Into<String>) -> Self {
        Self {
            sha: key.checksum().to_string(),
            size: key.size(),
            path: path.into(),
        }
    }

    pub fn key(&self) -> depot_cas::Result<BlobKey> {
        BlobKey::new(self.sha.as_str(), self.size)
    }
}

impl CheckoutRequest {
    pub fn new(checkout_path: impl Into<String>) -> Self {
        Self {
            checkout_path: checkout_path.into(),
            files: Vec::new(),
        }
    }

    /// Add a file, builder style.
    pub fn with_file(mut self, key: &BlobKey, path: impl Into<String>) -> Self {
        self.files.push(FileSpec::new(key, path));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json() {
        let json = r#"{
            "checkoutPath": "job1",
            "files": [
                {"sha": "590c148428d5c35fab3ebad2f3365bb469ab9c531b60831f3e826c472027a0b9",
                 "size": 3367, "path": "scene.blend"}
            ]
        }"#;
        let req: CheckoutRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.checkout_path, "job1");
        assert_eq!(req.files.len(), 1);
        assert_eq!(req.files[0].path, "scene.blend");
        assert_eq!(req.files[0].key().unwrap().size(), 3367);
    }

    #[test]
    fn test_bad_checksum_surfaces_on_key() {
        let spec = FileSpec {
            sha: "not-a-checksum".to_string(),
            size: 1,
            path: "x".to_string(),
        };
        assert!(spec.key().is_err());
    }

    #[test]
    fn test_builder_serializes_camel_case() {
        let key = BlobKey::for_bytes(b"data");
        let req = CheckoutRequest::new("job").with_file(&key, "a/b.txt");
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"checkoutPath\":\"job\""));
        assert!(json.contains(key.checksum()));
    }
}
