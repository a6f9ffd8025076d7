//! 子进程管道上的记录分帧。
//!
//! 每条记录是大端u32长度前缀加JSON载荷。载荷里有任意的用户
//! JSON, 不能用行分隔。所有I/O错误(包括对端提前关闭造成的EOF)
//! 都折叠成 [`QfarmError::StreamFailure`]。

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use qfarm_core::{QfarmError, Result};

/// 单条记录的上限, 防御性地挡住坏长度前缀
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// 写一条记录并冲刷
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_vec(value)?;
    if payload.len() > MAX_FRAME_BYTES as usize {
        return Err(QfarmError::StreamFailure(format!(
            "记录过大: {} 字节",
            payload.len()
        )));
    }
    writer
        .write_u32(payload.len() as u32)
        .await
        .map_err(|err| QfarmError::StreamFailure(format!("写入帧长度失败: {err}")))?;
    writer
        .write_all(&payload)
        .await
        .map_err(|err| QfarmError::StreamFailure(format!("写入帧体失败: {err}")))?;
    writer
        .flush()
        .await
        .map_err(|err| QfarmError::StreamFailure(format!("冲刷管道失败: {err}")))?;
    Ok(())
}

/// 读一条记录
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader
        .read_u32()
        .await
        .map_err(|err| QfarmError::StreamFailure(format!("读取帧长度失败: {err}")))?;
    if len > MAX_FRAME_BYTES {
        return Err(QfarmError::StreamFailure(format!("帧长度超限: {len}")));
    }
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|err| QfarmError::StreamFailure(format!("读取帧体失败: {err}")))?;
    Ok(serde_json::from_slice(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use qfarm_core::WorkPackage;
    use serde_json::json;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut left, mut right) = tokio::io::duplex(4096);
        let package = WorkPackage::new("demo:double", vec![json!(21)], serde_json::Map::new());

        write_frame(&mut left, &package).await.unwrap();
        let back: WorkPackage = read_frame(&mut right).await.unwrap();
        assert_eq!(back, package);
    }

    #[tokio::test]
    async fn test_two_sequential_frames() {
        let (mut left, mut right) = tokio::io::duplex(4096);
        write_frame(&mut left, &json!({"first": 1})).await.unwrap();
        write_frame(&mut left, &json!({"second": 2})).await.unwrap();

        let first: serde_json::Value = read_frame(&mut right).await.unwrap();
        let second: serde_json::Value = read_frame(&mut right).await.unwrap();
        assert_eq!(first, json!({"first": 1}));
        assert_eq!(second, json!({"second": 2}));
    }

    #[tokio::test]
    async fn test_eof_is_stream_failure() {
        let (left, mut right) = tokio::io::duplex(4096);
        drop(left);
        let err = read_frame::<_, serde_json::Value>(&mut right)
            .await
            .unwrap_err();
        assert!(matches!(err, QfarmError::StreamFailure(_)));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_stream_failure() {
        let (mut left, mut right) = tokio::io::duplex(4096);
        // 声称100字节却只给4个
        left.write_u32(100).await.unwrap();
        left.write_all(b"abcd").await.unwrap();
        drop(left);

        let err = read_frame::<_, serde_json::Value>(&mut right)
            .await
            .unwrap_err();
        assert!(matches!(err, QfarmError::StreamFailure(_)));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (mut left, mut right) = tokio::io::duplex(4096);
        left.write_u32(MAX_FRAME_BYTES + 1).await.unwrap();

        let err = read_frame::<_, serde_json::Value>(&mut right)
            .await
            .unwrap_err();
        assert!(matches!(err, QfarmError::StreamFailure(_)));
    }
}
