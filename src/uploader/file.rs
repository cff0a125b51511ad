// 待上传的视频文件
//
// 数据来源可以是本地路径（发送时按块读取）或内存缓冲区

use crate::uploader::part::PIECE_SIZE;
use crate::uploader::UploadError;
use bytes::Bytes;
use futures::stream::{self, Stream};
use std::io::{self, SeekFrom};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

/// 默认 MIME 类型（文件类型为空时使用）
pub const DEFAULT_MIME_TYPE: &str = "video/mp4";

/// 允许上传的视频格式（MP4 最佳）
pub const ALLOWED_VIDEO_TYPES: &[&str] = &["video/mp4", "video/quicktime", "video/webm", "video/mpeg"];

/// 文件数据来源
#[derive(Debug, Clone)]
enum FileSource {
    /// 本地文件
    Path(PathBuf),
    /// 内存数据
    Memory(Bytes),
}

/// 视频文件
#[derive(Debug, Clone)]
pub struct VideoFile {
    /// 原始文件名
    pub name: String,
    /// 文件大小（字节）
    pub size: u64,
    /// MIME 类型，可能为空
    pub mime_type: String,
    source: FileSource,
}

impl VideoFile {
    /// 从内存数据创建
    pub fn from_bytes(name: impl Into<String>, mime_type: impl Into<String>, data: Bytes) -> Self {
        Self {
            name: name.into(),
            size: data.len() as u64,
            mime_type: mime_type.into(),
            source: FileSource::Memory(data),
        }
    }

    /// 从本地路径创建（读取元数据，MIME 由扩展名推断）
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, UploadError> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| UploadError::InvalidInput(format!("无法读取文件信息 {:?}: {}", path, e)))?;

        if !metadata.is_file() {
            return Err(UploadError::InvalidInput(format!("不是普通文件: {:?}", path)));
        }

        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("video.mp4")
            .to_string();

        Ok(Self {
            mime_type: guess_mime_type(path).unwrap_or_default().to_string(),
            name,
            size: metadata.len(),
            source: FileSource::Path(path.to_path_buf()),
        })
    }

    /// 文件类型为空时回退到默认类型
    pub fn effective_mime_type<'a>(&'a self, default: &'a str) -> &'a str {
        if self.mime_type.trim().is_empty() {
            default
        } else {
            &self.mime_type
        }
    }

    /// 取指定字节范围作为请求体（发送时才读取）
    pub fn body(&self, range: Range<u64>) -> Result<UploadBody, UploadError> {
        if range.end > self.size || range.start > range.end {
            return Err(UploadError::InvalidInput(format!(
                "读取范围越界: {}..{}, 文件大小={}",
                range.start, range.end, self.size
            )));
        }
        Ok(UploadBody {
            source: self.source.clone(),
            range,
        })
    }

    /// 整个文件作为请求体
    pub fn whole_body(&self) -> Result<UploadBody, UploadError> {
        self.body(0..self.size)
    }
}

/// 按需读取的字节流
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + Sync>>;

/// 请求体：文件中的一段字节范围
///
/// 只记录来源和范围，`open` 时才开始读取，同一时刻最多缓冲一块数据
#[derive(Debug, Clone)]
pub struct UploadBody {
    source: FileSource,
    range: Range<u64>,
}

impl UploadBody {
    /// 直接使用内存数据
    pub fn from_bytes(data: Bytes) -> Self {
        let len = data.len() as u64;
        Self {
            source: FileSource::Memory(data),
            range: 0..len,
        }
    }

    pub fn len(&self) -> u64 {
        self.range.end - self.range.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 打开数据流，每块最多 PIECE_SIZE 字节
    ///
    /// 每次重试都重新打开，不复用上一次尝试的数据
    pub async fn open(&self) -> Result<ByteStream, UploadError> {
        match &self.source {
            FileSource::Memory(data) => {
                let data = data.slice(self.range.start as usize..self.range.end as usize);
                let len = data.len();
                let pieces = (0..len)
                    .step_by(PIECE_SIZE)
                    .map(move |start| {
                        Ok::<_, io::Error>(data.slice(start..std::cmp::min(start + PIECE_SIZE, len)))
                    });
                Ok(Box::pin(stream::iter(pieces)))
            }
            FileSource::Path(path) => {
                let mut file = File::open(path)
                    .await
                    .map_err(|e| UploadError::InvalidInput(format!("打开上传文件失败 {:?}: {}", path, e)))?;

                file.seek(SeekFrom::Start(self.range.start))
                    .await
                    .map_err(|e| UploadError::InvalidInput(format!("文件定位失败: {}", e)))?;

                debug!(
                    "打开文件数据流: {:?}, bytes={}-{}",
                    path,
                    self.range.start,
                    self.range.end.saturating_sub(1)
                );

                Ok(Box::pin(ReaderStream::with_capacity(
                    file.take(self.len()),
                    PIECE_SIZE,
                )))
            }
        }
    }
}

/// 根据扩展名推断视频 MIME 类型
pub fn guess_mime_type(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "mp4" | "m4v" => Some("video/mp4"),
        "mov" => Some("video/quicktime"),
        "webm" => Some("video/webm"),
        "mpeg" | "mpg" => Some("video/mpeg"),
        _ => None,
    }
}

/// 上传前校验文件，返回实际使用的 MIME 类型
pub fn validate_file(
    file: &VideoFile,
    allowed_types: &[String],
    default_mime: &str,
) -> Result<String, UploadError> {
    if file.size == 0 {
        return Err(UploadError::InvalidInput(format!("文件为空: {}", file.name)));
    }

    let mime = file.effective_mime_type(default_mime);
    if !allowed_types.iter().any(|t| t.eq_ignore_ascii_case(mime)) {
        return Err(UploadError::InvalidInput(format!(
            "不支持的文件类型: {} ({})，仅支持 {}",
            file.name,
            mime,
            allowed_types.join(", ")
        )));
    }

    Ok(mime.to_string())
}
