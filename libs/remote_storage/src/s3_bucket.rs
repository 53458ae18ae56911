//! AWS S3 storage wrapper around `aws_sdk_s3` library.
//!
//! Respects `prefix_in_bucket` property from [`S3Config`],
//! allowing multiple api users to independently work with the same S3 bucket, if
//! their bucket prefixes are both specified and different.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use aws_config::{
    environment::credentials::EnvironmentVariableCredentialsProvider,
    imds::credentials::ImdsCredentialsProvider, meta::credentials::CredentialsProviderChain,
};
use aws_sdk_s3::{
    config::{BehaviorVersion, Config, Region},
    error::SdkError,
    operation::get_object::GetObjectError,
    primitives::ByteStream,
    Client,
};
use bytes::Bytes;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::{DownloadError, RemotePath, RemoteStorage, S3Config, REMOTE_STORAGE_PREFIX_SEPARATOR};

/// AWS S3 storage.
pub struct S3Bucket {
    client: Client,
    bucket_name: String,
    prefix_in_bucket: Option<String>,
    max_keys_per_list_response: Option<i32>,
    // Every request to S3 can be throttled or cancelled, if a certain number of requests per second is exceeded.
    // Same goes to IAM, which is queried before every S3 request, if enabled. IAM has even lower RPS threshold.
    concurrency_limiter: Arc<Semaphore>,
    timeout: Duration,
}

impl S3Bucket {
    /// Creates the S3 storage, errors if incorrect AWS S3 configuration provided.
    pub fn new(aws_config: &S3Config, timeout: Duration) -> anyhow::Result<Self> {
        debug!(
            "Creating s3 remote storage for S3 bucket {}",
            aws_config.bucket_name
        );

        let credentials_provider = {
            // uses "AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"
            CredentialsProviderChain::first_try(
                "env",
                EnvironmentVariableCredentialsProvider::new(),
            )
            // uses imds v2
            .or_else("imds", ImdsCredentialsProvider::builder().build())
        };

        let mut config_builder = Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(aws_config.bucket_region.clone()))
            .credentials_provider(credentials_provider);

        if let Some(custom_endpoint) = aws_config.endpoint.clone() {
            config_builder = config_builder
                .endpoint_url(custom_endpoint)
                .force_path_style(true);
        }
        let client = Client::from_conf(config_builder.build());

        let prefix_in_bucket = aws_config.prefix_in_bucket.as_deref().map(|prefix| {
            let mut prefix = prefix;
            while prefix.starts_with(REMOTE_STORAGE_PREFIX_SEPARATOR) {
                prefix = &prefix[1..]
            }

            let mut prefix = prefix.to_string();
            while prefix.ends_with(REMOTE_STORAGE_PREFIX_SEPARATOR) {
                prefix.pop();
            }
            prefix
        });
        Ok(Self {
            client,
            bucket_name: aws_config.bucket_name.clone(),
            max_keys_per_list_response: aws_config.max_keys_per_list_response,
            prefix_in_bucket,
            concurrency_limiter: Arc::new(Semaphore::new(aws_config.concurrency_limit.get())),
            timeout,
        })
    }

    fn s3_object_to_relative_path(&self, key: &str) -> anyhow::Result<RemotePath> {
        let relative_path = match &self.prefix_in_bucket {
            Some(prefix) => key
                .strip_prefix(prefix.as_str())
                .map(|rest| rest.trim_start_matches(REMOTE_STORAGE_PREFIX_SEPARATOR))
                .with_context(|| {
                    format!("Key {key} does not start with bucket prefix {prefix:?}")
                })?,
            None => key,
        };
        RemotePath::from_string(relative_path)
    }

    pub fn relative_path_to_s3_object(&self, path: &RemotePath) -> String {
        let path_string = path
            .get_path()
            .as_str()
            .trim_end_matches(REMOTE_STORAGE_PREFIX_SEPARATOR);
        match &self.prefix_in_bucket {
            Some(prefix) if path_string.is_empty() => prefix.clone() + "/",
            Some(prefix) => prefix.clone() + "/" + path_string,
            None => path_string.to_string(),
        }
    }

    async fn permit(&self) -> anyhow::Result<tokio::sync::SemaphorePermit<'_>> {
        self.concurrency_limiter
            .acquire()
            .await
            .context("concurrency limiter closed")
    }

    async fn timed<T, E>(
        &self,
        fut: impl std::future::Future<Output = Result<T, E>>,
    ) -> Result<Result<T, E>, DownloadError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_elapsed| DownloadError::Timeout)
    }
}

#[async_trait::async_trait]
impl RemoteStorage for S3Bucket {
    async fn list(&self, prefix: Option<&RemotePath>) -> Result<Vec<RemotePath>, DownloadError> {
        let list_prefix = prefix
            .map(|p| {
                let mut p = self.relative_path_to_s3_object(p);
                // only whole path segments match, "tenants/a" must not list "tenants/ab"
                if !p.ends_with(REMOTE_STORAGE_PREFIX_SEPARATOR) {
                    p.push(REMOTE_STORAGE_PREFIX_SEPARATOR);
                }
                p
            })
            .or_else(|| self.prefix_in_bucket.clone().map(|p| p + "/"));

        // AWS may need to break the response into several parts
        let mut continuation_token = None;
        let mut all_files = vec![];
        loop {
            let _guard = self.permit().await.map_err(DownloadError::Other)?;

            let response = self
                .timed(
                    self.client
                        .list_objects_v2()
                        .bucket(self.bucket_name.clone())
                        .set_prefix(list_prefix.clone())
                        .set_continuation_token(continuation_token)
                        .set_max_keys(self.max_keys_per_list_response)
                        .send(),
                )
                .await?
                .context("Failed to list files in S3 bucket")
                .map_err(DownloadError::Other)?;

            for object in response.contents() {
                let object_path = object
                    .key()
                    .context("response does not contain a key")
                    .map_err(DownloadError::Other)?;
                let remote_path = self
                    .s3_object_to_relative_path(object_path)
                    .map_err(DownloadError::Other)?;
                all_files.push(remote_path);
            }
            match response.next_continuation_token() {
                Some(new_token) => continuation_token = Some(new_token.to_string()),
                None => break,
            }
        }
        Ok(all_files)
    }

    async fn put(&self, data: Bytes, to: &RemotePath) -> anyhow::Result<()> {
        let _guard = self.permit().await?;

        let content_length = i64::try_from(data.len())?;
        self.timed(
            self.client
                .put_object()
                .bucket(self.bucket_name.clone())
                .key(self.relative_path_to_s3_object(to))
                .content_length(content_length)
                .body(ByteStream::from(data))
                .send(),
        )
        .await?
        .with_context(|| format!("upload {to} to s3"))?;

        Ok(())
    }

    async fn get(&self, from: &RemotePath) -> Result<Bytes, DownloadError> {
        let _guard = self.permit().await.map_err(DownloadError::Other)?;

        let get_object = self
            .timed(
                self.client
                    .get_object()
                    .bucket(self.bucket_name.clone())
                    .key(self.relative_path_to_s3_object(from))
                    .send(),
            )
            .await?;

        match get_object {
            Ok(object_output) => {
                let body = self
                    .timed(object_output.body.collect())
                    .await?
                    .context("read s3 object body")
                    .map_err(DownloadError::Other)?;
                Ok(body.into_bytes())
            }
            Err(SdkError::ServiceError(e)) if matches!(e.err(), GetObjectError::NoSuchKey(_)) => {
                Err(DownloadError::NotFound)
            }
            Err(e) => Err(DownloadError::Other(
                anyhow::Error::new(e).context("download s3 object"),
            )),
        }
    }

    async fn delete(&self, path: &RemotePath) -> anyhow::Result<()> {
        let _guard = self.permit().await?;

        self.timed(
            self.client
                .delete_object()
                .bucket(self.bucket_name.clone())
                .key(self.relative_path_to_s3_object(path))
                .send(),
        )
        .await?
        .with_context(|| format!("delete {path} from s3"))?;

        Ok(())
    }
}
