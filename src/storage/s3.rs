use super::{
    ObjectMeta, ObjectStore, SourceReader, StoreError, UploadBody, UploadPolicy, UploadToken,
    IO_TIMEOUT_SECS, OP_TIMEOUT_SECS,
};
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use opendal::{layers::TimeoutLayer, Operator};
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

/// 分片大小，文件超过该大小时使用分片上传（EtagHasher 需使用相同的值）
pub const PART_SIZE: usize = 8 * 1024 * 1024;

/// 读取源文件的缓冲大小
const READ_BUFFER_SIZE: usize = 256 * 1024;

impl From<opendal::Error> for StoreError {
    fn from(e: opendal::Error) -> Self {
        match e.kind() {
            opendal::ErrorKind::NotFound => StoreError::NotFound(e.to_string()),
            opendal::ErrorKind::PermissionDenied => StoreError::Unauthorized(e.to_string()),
            _ => StoreError::Backend(e.to_string()),
        }
    }
}

/// S3 兼容对象存储（七牛 Kodo、MinIO、AWS S3 等）
pub struct S3ObjectStore {
    operator: Operator,
    bucket: String,
    name: String,
}

impl S3ObjectStore {
    pub fn new(
        bucket: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        endpoint: Option<String>,
        policy: &UploadPolicy,
    ) -> Result<Self> {
        use opendal::services::S3;

        let mut builder = S3::default()
            .bucket(bucket)
            .region(region)
            .access_key_id(access_key)
            .secret_access_key(secret_key);

        if let Some(ref ep) = endpoint {
            builder = builder.endpoint(ep);
        }

        // fileType=1 对应低频存储
        if policy.file_type == 1 {
            builder = builder.default_storage_class("STANDARD_IA");
        }

        let operator = Operator::new(builder)?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish();

        let name = format!(
            "s3://{}{}",
            bucket,
            endpoint
                .as_deref()
                .map(|ep| format!(" ({})", ep))
                .unwrap_or_default()
        );

        Ok(Self {
            operator,
            bucket: bucket.to_string(),
            name,
        })
    }

    /// 使用已构建好的 Operator（测试或其他 opendal 服务）
    pub fn with_operator(operator: Operator, bucket: &str) -> Self {
        Self {
            operator,
            bucket: bucket.to_string(),
            name: format!("opendal://{}", bucket),
        }
    }

    /// 流式分片写入
    async fn write_stream(&self, key: &str, reader: SourceReader, size: u64) -> Result<(), StoreError> {
        let mut writer = self.operator.writer_with(key).chunk(PART_SIZE).await?;
        let mut stream = ReaderStream::with_capacity(reader, READ_BUFFER_SIZE);
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(e.into());
                }
            };
            written += chunk.len() as u64;
            if let Err(e) = writer.write(chunk).await {
                let _ = writer.abort().await;
                return Err(e.into());
            }
        }

        writer.close().await?;

        if written != size {
            // 扫描后文件发生了变化，下次运行会因修改时间不同而重新上传
            warn!(
                "{} 上传字节数 {} 与快照大小 {} 不一致，源文件可能在扫描后被修改",
                key, written, size
            );
        }

        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn stat(&self, key: &str) -> Result<ObjectMeta, StoreError> {
        let meta = self.operator.stat(key).await?;
        Ok(ObjectMeta {
            size: meta.content_length(),
            content_hash: meta.etag().map(|s| s.trim_matches('"').to_string()),
        })
    }

    async fn upload_token(
        &self,
        key: Option<&str>,
        ttl: Duration,
        policy: &UploadPolicy,
    ) -> Result<UploadToken, StoreError> {
        Ok(UploadToken {
            bucket: self.bucket.clone(),
            key: key.map(str::to_string),
            deadline: chrono::Utc::now().timestamp() + ttl.as_secs() as i64,
            policy: policy.clone(),
        })
    }

    async fn put(&self, token: &UploadToken, key: &str, body: UploadBody) -> Result<(), StoreError> {
        token.authorize(key)?;

        if token.insert_only() {
            match self.operator.stat(key).await {
                Ok(_) => return Err(StoreError::Exists(key.to_string())),
                Err(e) if e.kind() == opendal::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        match body {
            UploadBody::Empty => {
                debug!("上传空对象: {}", key);
                self.operator.write(key, Vec::<u8>::new()).await?;
            }
            UploadBody::Stream { reader, size } => {
                self.write_stream(key, reader, size).await?;
            }
        }

        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
