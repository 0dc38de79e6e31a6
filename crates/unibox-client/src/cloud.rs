//! Cloud storage strategy table.
//!
//! Vendor SDKs live outside the core. Each one is registered as a
//! [`CloudStorage`] adapter under its [`CloudService`] code; the active
//! service and its credentials are looked up from settings for every job.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use unibox_shared::types::CloudService;
use unibox_shared::CoreError;
use unibox_store::Settings;

pub type Credentials = HashMap<String, String>;

/// `(downloaded, total)` in bytes.
pub type ProgressFn<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub created_time: Option<DateTime<Utc>>,
    pub download_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub cloud_id: String,
    /// Publicly resolvable link, when the service hands one out.
    pub url: Option<String>,
}

/// Uniform contract every vendor adapter satisfies.
#[async_trait]
pub trait CloudStorage: Send + Sync {
    /// Files in the application folder.
    async fn list_files(&self, credentials: &Credentials) -> anyhow::Result<Vec<RemoteFile>>;

    /// Fetch `cloud_id` into `dest_dir`, returning the written path.
    async fn download_file(
        &self,
        credentials: &Credentials,
        cloud_id: &str,
        dest_dir: &Path,
        progress: ProgressFn<'_>,
    ) -> anyhow::Result<PathBuf>;

    async fn upload_file(
        &self,
        credentials: &Credentials,
        local_path: &Path,
        name: &str,
    ) -> anyhow::Result<UploadedFile>;

    async fn delete_file(&self, credentials: &Credentials, cloud_id: &str) -> anyhow::Result<()>;
}

fn credential_prefix(service: CloudService) -> &'static str {
    match service {
        CloudService::None => "",
        CloudService::GoogleDrive => "google_drive_",
        CloudService::OneDrive => "onedrive_",
        CloudService::TencentCos => "tencent_cos_",
        CloudService::QiniuKodo => "qiniu_kodo_",
    }
}

#[derive(Default, Clone)]
pub struct CloudServiceTable {
    adapters: HashMap<CloudService, Arc<dyn CloudStorage>>,
}

impl CloudServiceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, service: CloudService, adapter: Arc<dyn CloudStorage>) -> Self {
        self.adapters.insert(service, adapter);
        self
    }

    /// Adapter and credentials for the configured service.
    pub fn resolve(&self, settings: &Settings) -> Result<ActiveCloud, CoreError> {
        let service = settings.cloud_service;
        if service == CloudService::None {
            return Err(CoreError::ConfigurationMissing("no cloud service selected".into()));
        }
        let adapter = self.adapters.get(&service).ok_or_else(|| {
            CoreError::ConfigurationMissing(format!("no adapter registered for {service}"))
        })?;
        if let Some(missing) = service
            .required_credentials()
            .iter()
            .find(|key| settings.credential(key).is_none())
        {
            return Err(CoreError::ConfigurationMissing(format!(
                "{service} requires {missing}"
            )));
        }

        let prefix = credential_prefix(service);
        let credentials = settings
            .credentials
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Ok(ActiveCloud {
            service,
            adapter: Arc::clone(adapter),
            credentials,
        })
    }

    /// Files stored by the active service.
    pub async fn list_remote_files(&self, settings: &Settings) -> Result<Vec<RemoteFile>, CoreError> {
        self.resolve(settings)?.list_files().await
    }
}

/// A resolved service. Adapter errors come back as [`CoreError::CloudAdapterFailure`].
#[derive(Clone)]
pub struct ActiveCloud {
    pub service: CloudService,
    adapter: Arc<dyn CloudStorage>,
    credentials: Credentials,
}

impl ActiveCloud {
    fn failure(&self, e: anyhow::Error) -> CoreError {
        CoreError::CloudAdapterFailure {
            service: self.service,
            reason: format!("{e:#}"),
        }
    }

    pub async fn list_files(&self) -> Result<Vec<RemoteFile>, CoreError> {
        self.adapter
            .list_files(&self.credentials)
            .await
            .map_err(|e| self.failure(e))
    }

    pub async fn download(
        &self,
        cloud_id: &str,
        dest_dir: &Path,
        progress: ProgressFn<'_>,
    ) -> Result<PathBuf, CoreError> {
        self.adapter
            .download_file(&self.credentials, cloud_id, dest_dir, progress)
            .await
            .map_err(|e| self.failure(e))
    }

    pub async fn upload(&self, local_path: &Path, name: &str) -> Result<UploadedFile, CoreError> {
        debug!(service = %self.service, path = %local_path.display(), "Uploading file");
        self.adapter
            .upload_file(&self.credentials, local_path, name)
            .await
            .map_err(|e| self.failure(e))
    }

    pub async fn delete(&self, cloud_id: &str) -> Result<(), CoreError> {
        self.adapter
            .delete_file(&self.credentials, cloud_id)
            .await
            .map_err(|e| self.failure(e))
    }
}
