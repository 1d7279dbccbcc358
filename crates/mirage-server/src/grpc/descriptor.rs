//! Descriptor manager for user-uploaded `.proto` bundles.
//!
//! Each gRPC project uploads its proto files as a zip with the relative
//! import layout preserved. The manager downloads and extracts a bundle on
//! first use, compiles it with the bundle directory as the sole import path,
//! and indexes every service and message by fully-qualified name.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use prost_reflect::DescriptorPool;
use thiserror::Error;
use tonic::{Code, Status};
use tracing::{error, info};

use crate::storage::{FileStorage, StorageError};

const ZIP_NAME: &str = "bundle.zip";

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("descriptor io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse proto bundle: {0}")]
    Parse(String),
}

/// Manages descriptors for all uploaded projects. Initialization runs under
/// an exclusive lock; cache hits return the shared instance.
pub struct ServiceDescriptors {
    files: Arc<dyn FileStorage>,
    cache_dir: PathBuf,
    descriptors: tokio::sync::Mutex<HashMap<String, Arc<Descriptor>>>,
}

impl ServiceDescriptors {
    pub fn new(files: Arc<dyn FileStorage>) -> Self {
        Self {
            files,
            cache_dir: std::env::temp_dir().join("cached_grpc_protos"),
            descriptors: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Loads the descriptor for a bundle, downloading and compiling it on the
    /// first call. Idempotent; later calls return the cached instance.
    pub async fn get_descriptor(&self, file_id: &str) -> Result<Arc<Descriptor>, DescriptorError> {
        let mut descriptors = self.descriptors.lock().await;
        if let Some(descriptor) = descriptors.get(file_id) {
            return Ok(Arc::clone(descriptor));
        }

        let bundle_dir = self.cache_dir.join(file_id);
        self.download_if_not_exist(&bundle_dir, file_id).await?;

        let pool = load_pool(bundle_dir).await?;
        let descriptor = Arc::new(Descriptor::from_pool(&pool));

        descriptors.insert(file_id.to_string(), Arc::clone(&descriptor));
        Ok(descriptor)
    }

    /// Drops cached descriptors and the on-disk extracted bundles.
    pub async fn clear_cache(&self) -> Result<(), DescriptorError> {
        let mut descriptors = self.descriptors.lock().await;
        descriptors.clear();

        match tokio::fs::remove_dir_all(&self.cache_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                error!("cannot remove descriptor cache: {e}");
                Err(e.into())
            }
        }
    }

    async fn download_if_not_exist(
        &self,
        bundle_dir: &Path,
        file_id: &str,
    ) -> Result<(), DescriptorError> {
        let zip_path = bundle_dir.join(ZIP_NAME);
        if tokio::fs::try_exists(&zip_path).await? {
            return Ok(());
        }

        let data = self.files.download_file(file_id).await.map_err(|e| {
            error!("cannot download proto bundle {file_id}");
            e
        })?;

        tokio::fs::create_dir_all(bundle_dir).await?;
        tokio::fs::write(&zip_path, &data).await?;
        info!("downloaded bundle {file_id} to {}", zip_path.display());

        let bundle_dir = bundle_dir.to_path_buf();
        tokio::task::spawn_blocking(move || extract_zip(&bundle_dir.join(ZIP_NAME), &bundle_dir))
            .await
            .map_err(|e| DescriptorError::Parse(e.to_string()))?
    }
}

/// Compiles every `.proto` under the bundle directory into a descriptor
/// pool, with the directory as the sole import path.
async fn load_pool(bundle_dir: PathBuf) -> Result<DescriptorPool, DescriptorError> {
    tokio::task::spawn_blocking(move || {
        let proto_files = collect_proto_files(&bundle_dir)?;
        info!(
            "loading {} proto files from {}",
            proto_files.len(),
            bundle_dir.display()
        );

        let file_set = protox::compile(&proto_files, [&bundle_dir]).map_err(|e| {
            error!("cannot compile protos in {}: {e}", bundle_dir.display());
            DescriptorError::Parse(e.to_string())
        })?;

        DescriptorPool::from_file_descriptor_set(file_set)
            .map_err(|e| DescriptorError::Parse(e.to_string()))
    })
    .await
    .map_err(|e| DescriptorError::Parse(e.to_string()))?
}

fn collect_proto_files(dir: &Path) -> Result<Vec<PathBuf>, DescriptorError> {
    let mut paths = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|ext| ext == "proto") {
                paths.push(path);
            }
        }
    }

    paths.sort();
    Ok(paths)
}

/// Extracts a zip bundle, refusing entries that would escape the output
/// root (zip-slip). Entries stream to disk.
fn extract_zip(zip_path: &Path, output_dir: &Path) -> Result<(), DescriptorError> {
    let file = std::fs::File::open(zip_path)?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| DescriptorError::Parse(e.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| DescriptorError::Parse(e.to_string()))?;

        // enclosed_name refuses absolute paths and parent traversal
        let relative = match entry.enclosed_name() {
            Some(name) => name.to_path_buf(),
            None => {
                return Err(DescriptorError::Parse(format!(
                    "zip entry escapes the bundle root: {}",
                    entry.name()
                )))
            }
        };

        let target = output_dir.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out)?;
    }

    Ok(())
}

/// Parsed services and messages of one uploaded bundle.
pub struct Descriptor {
    services: RwLock<HashMap<String, prost_reflect::ServiceDescriptor>>,
    messages: RwLock<HashMap<String, prost_reflect::MessageDescriptor>>,
}

impl Descriptor {
    fn from_pool(pool: &DescriptorPool) -> Self {
        let mut services = HashMap::new();
        let mut messages = HashMap::new();

        for service in pool.services() {
            services.insert(service.full_name().to_string(), service);
        }

        for message in pool.all_messages() {
            messages.insert(message.full_name().to_string(), message);
        }

        Self {
            services: RwLock::new(services),
            messages: RwLock::new(messages),
        }
    }

    /// Builds a descriptor straight from proto sources, for tests.
    pub fn from_sources(
        files: &[(&str, &str)],
        root: &Path,
    ) -> Result<Self, DescriptorError> {
        for (name, content) in files {
            let path = root.join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, content)?;
        }

        let proto_files = collect_proto_files(root)?;
        let file_set = protox::compile(&proto_files, [root])
            .map_err(|e| DescriptorError::Parse(e.to_string()))?;
        let pool = DescriptorPool::from_file_descriptor_set(file_set)
            .map_err(|e| DescriptorError::Parse(e.to_string()))?;

        Ok(Self::from_pool(&pool))
    }

    /// Resolves a method by its full path `/pkg.Service/Method`. Streaming
    /// methods are not simulated and report unimplemented.
    pub fn get_method(&self, method_path: &str) -> Result<prost_reflect::MethodDescriptor, Status> {
        let mut parts = method_path.split('/');
        let (service_name, method_name) = match (parts.next(), parts.next(), parts.next()) {
            (Some(""), Some(service), Some(method)) => (service, method),
            _ => {
                return Err(Status::new(
                    Code::InvalidArgument,
                    format!("invalid method {method_path}"),
                ))
            }
        };

        let services = self.services.read();
        let service = services.get(service_name).ok_or_else(|| {
            Status::new(Code::NotFound, format!("cannot find service {service_name}"))
        })?;

        let method = service
            .methods()
            .find(|m| m.name() == method_name)
            .ok_or_else(|| {
                Status::new(Code::NotFound, format!("cannot find method {method_name}"))
            })?;

        if method.is_client_streaming() || method.is_server_streaming() {
            return Err(Status::new(
                Code::Unimplemented,
                format!("streaming is not supported: {method_path}"),
            ));
        }

        Ok(method)
    }

    /// Resolves a message by fully-qualified name or type url; the suffix
    /// after the last `/` is the lookup key.
    pub fn get_message(&self, name: &str) -> Result<prost_reflect::MessageDescriptor, Status> {
        let key = name.rsplit('/').next().unwrap_or(name);

        let messages = self.messages.read();
        messages.get(key).cloned().ok_or_else(|| {
            Status::new(Code::NotFound, format!("message type {key} not found"))
        })
    }

    /// Full paths of every unary-callable method in the bundle.
    pub fn get_all_methods(&self) -> Vec<String> {
        let services = self.services.read();
        let mut methods = Vec::new();

        for service in services.values() {
            for method in service.methods() {
                methods.push(format!("/{}/{}", service.full_name(), method.name()));
            }
        }

        methods.sort();
        methods
    }

    pub fn get_all_messages(&self) -> Vec<String> {
        let messages = self.messages.read();
        let mut names: Vec<String> = messages.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
pub(crate) const TEST_PROTO: &str = r#"syntax = "proto3";

package offers.v1;

import "common/errors.proto";

message ValidateOfferRequest {
  string request_id = 1;
}

message ValidateOfferResponse {
  string verdict = 1;
  common.v1.CommonError error = 2;
}

service OfferService {
  rpc ValidateOffer(ValidateOfferRequest) returns (ValidateOfferResponse);
}
"#;

#[cfg(test)]
pub(crate) const TEST_COMMON_PROTO: &str = r#"syntax = "proto3";

package common.v1;

message CommonError {
  string verdict = 1;
}
"#;

/// Test helper: compiles the in-repo offer service protos.
#[cfg(test)]
pub(crate) fn test_descriptor() -> Descriptor {
    let dir = tempfile::tempdir().unwrap();
    Descriptor::from_sources(
        &[
            ("offers.proto", TEST_PROTO),
            ("common/errors.proto", TEST_COMMON_PROTO),
        ],
        dir.path(),
    )
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_method() {
        let descriptor = test_descriptor();
        let method = descriptor
            .get_method("/offers.v1.OfferService/ValidateOffer")
            .unwrap();
        assert_eq!(method.name(), "ValidateOffer");
        assert_eq!(method.input().full_name(), "offers.v1.ValidateOfferRequest");
    }

    #[test]
    fn test_get_method_not_found() {
        let descriptor = test_descriptor();
        let err = descriptor
            .get_method("/offers.v1.OfferService/Missing")
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);

        let err = descriptor
            .get_method("/unknown.Service/Method")
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
    }

    #[test]
    fn test_get_method_invalid_path() {
        let descriptor = test_descriptor();
        let err = descriptor.get_method("not-a-path").unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[test]
    fn test_get_message_by_name_and_type_url() {
        let descriptor = test_descriptor();

        let by_name = descriptor.get_message("common.v1.CommonError").unwrap();
        assert_eq!(by_name.full_name(), "common.v1.CommonError");

        let by_url = descriptor
            .get_message("type.googleapis.com/common.v1.CommonError")
            .unwrap();
        assert_eq!(by_url.full_name(), "common.v1.CommonError");

        assert!(descriptor.get_message("missing.Type").is_err());
    }

    #[test]
    fn test_get_all_methods_and_messages() {
        let descriptor = test_descriptor();
        assert_eq!(
            descriptor.get_all_methods(),
            vec!["/offers.v1.OfferService/ValidateOffer".to_string()]
        );

        let messages = descriptor.get_all_messages();
        assert!(messages.contains(&"common.v1.CommonError".to_string()));
        assert!(messages.contains(&"offers.v1.ValidateOfferRequest".to_string()));
    }

    #[tokio::test]
    async fn test_service_descriptors_load_from_zip() {
        use crate::storage::{FileStorage, LocalStorage, LocalStorageConfig};

        let storage = Arc::new(LocalStorage::new(LocalStorageConfig {
            storage_path: format!("mirage-desc-test-{}", uuid::Uuid::new_v4()),
            use_temp_dir: true,
        }));

        // Build a zip bundle in memory
        let mut zip_bytes = Vec::new();
        {
            let mut writer =
                zip::ZipWriter::new(std::io::Cursor::new(&mut zip_bytes));
            let options = zip::write::SimpleFileOptions::default();
            use std::io::Write;

            writer.start_file("offers.proto", options).unwrap();
            writer.write_all(TEST_PROTO.as_bytes()).unwrap();
            writer.start_file("common/errors.proto", options).unwrap();
            writer.write_all(TEST_COMMON_PROTO.as_bytes()).unwrap();
            writer.finish().unwrap();
        }

        let file_id = uuid::Uuid::new_v4().to_string();
        storage.upload_file(&file_id, zip_bytes).await.unwrap();

        let manager = ServiceDescriptors {
            files: storage,
            cache_dir: std::env::temp_dir().join(format!("mirage-desc-cache-{file_id}")),
            descriptors: tokio::sync::Mutex::new(HashMap::new()),
        };

        let descriptor = manager.get_descriptor(&file_id).await.unwrap();
        assert_eq!(descriptor.get_all_methods().len(), 1);

        // Second call is a cache hit returning the same instance
        let again = manager.get_descriptor(&file_id).await.unwrap();
        assert!(Arc::ptr_eq(&descriptor, &again));

        manager.clear_cache().await.unwrap();
    }

    #[test]
    fn test_extract_zip_rejects_escaping_entries() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("evil.zip");

        let mut zip_bytes = Vec::new();
        {
            let mut writer = zip::ZipWriter::new(std::io::Cursor::new(&mut zip_bytes));
            let options = zip::write::SimpleFileOptions::default();
            use std::io::Write;
            writer.start_file("../outside.proto", options).unwrap();
            writer.write_all(b"syntax = \"proto3\";").unwrap();
            writer.finish().unwrap();
        }
        std::fs::write(&zip_path, &zip_bytes).unwrap();

        let result = extract_zip(&zip_path, dir.path());
        assert!(result.is_err());
    }
}
