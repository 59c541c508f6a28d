//! 内容哈希 - 与目标存储返回的 ETag 直接比较

use crate::storage::SourceReader;
use async_trait::async_trait;
use md5::{Digest, Md5};
use tokio::io::AsyncReadExt;

const READ_BUFFER_SIZE: usize = 256 * 1024;

/// 内容哈希计算接口
#[async_trait]
pub trait ContentHasher: Send + Sync {
    /// 读取完整数据流计算哈希，读取长度与 known_len 不一致时返回错误
    async fn hash(&self, reader: SourceReader, known_len: u64) -> std::io::Result<String>;
}

/// S3 风格 ETag
///
/// 单分片时为整个内容的 MD5；多分片时为各分片 MD5 拼接后再做 MD5，
/// 并追加 `-分片数`。分片大小必须与上传时使用的一致。
pub struct EtagHasher {
    part_size: usize,
}

impl EtagHasher {
    pub fn new(part_size: usize) -> Self {
        Self {
            part_size: part_size.max(1),
        }
    }
}

#[async_trait]
impl ContentHasher for EtagHasher {
    async fn hash(&self, mut reader: SourceReader, known_len: u64) -> std::io::Result<String> {
        let mut buf = vec![0u8; READ_BUFFER_SIZE.min(self.part_size)];
        let mut parts = Vec::new();
        let mut part = Md5::new();
        let mut part_len = 0usize;
        let mut total = 0u64;

        loop {
            let want = (self.part_size - part_len).min(buf.len());
            let n = reader.read(&mut buf[..want]).await?;
            if n == 0 {
                break;
            }
            part.update(&buf[..n]);
            part_len += n;
            total += n as u64;
            if part_len == self.part_size {
                parts.push(part.finalize_reset());
                part_len = 0;
            }
        }

        if total != known_len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("读取 {} 字节，期望 {} 字节", total, known_len),
            ));
        }

        if part_len > 0 || parts.is_empty() {
            parts.push(part.finalize());
        }

        if parts.len() == 1 {
            return Ok(format!("{:x}", parts[0]));
        }

        let mut combined = Md5::new();
        for digest in &parts {
            combined.update(digest);
        }
        Ok(format!("{:x}-{}", combined.finalize(), parts.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader(data: &'static [u8]) -> SourceReader {
        Box::new(data)
    }

    fn md5_hex(data: &[u8]) -> String {
        format!("{:x}", Md5::digest(data))
    }

    #[tokio::test]
    async fn test_single_part_is_plain_md5() {
        let hasher = EtagHasher::new(1024);
        assert_eq!(
            hasher.hash(reader(b""), 0).await.unwrap(),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
        assert_eq!(
            hasher.hash(reader(b"abc"), 3).await.unwrap(),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[tokio::test]
    async fn test_multipart_etag() {
        let hasher = EtagHasher::new(4);
        let etag = hasher.hash(reader(b"abcdefghij"), 10).await.unwrap();

        let mut combined = Md5::new();
        for part in [&b"abcd"[..], b"efgh", b"ij"] {
            combined.update(Md5::digest(part));
        }
        assert_eq!(etag, format!("{:x}-3", combined.finalize()));
    }

    #[tokio::test]
    async fn test_exact_part_boundary() {
        let hasher = EtagHasher::new(5);
        let etag = hasher.hash(reader(b"abcdefghij"), 10).await.unwrap();

        let mut combined = Md5::new();
        combined.update(Md5::digest(b"abcde"));
        combined.update(Md5::digest(b"fghij"));
        assert_eq!(etag, format!("{:x}-2", combined.finalize()));

        // 恰好一个分片时不带分片数
        let hasher = EtagHasher::new(10);
        let etag = hasher.hash(reader(b"abcdefghij"), 10).await.unwrap();
        assert_eq!(etag, md5_hex(b"abcdefghij"));
    }

    #[tokio::test]
    async fn test_length_mismatch_is_error() {
        let hasher = EtagHasher::new(1024);
        let err = hasher.hash(reader(b"abc"), 4).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
