use futures::stream::{self, BoxStream, StreamExt};

use crate::{GfError, Result};

/// 把 HTTP 分块响应切分为按行的文本流 (NDJSON / SSE 共用)
pub(crate) fn response_lines(
    provider: &'static str,
    resp: reqwest::Response,
) -> BoxStream<'static, Result<String>> {
    let bytes = resp.bytes_stream().boxed();
    stream::unfold(
        (bytes, Vec::<u8>::new(), false),
        move |(mut bytes, mut buf, mut finished)| async move {
            loop {
                if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let raw: Vec<u8> = buf.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&raw).trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    return Some((Ok(line), (bytes, buf, finished)));
                }
                if finished {
                    let line = String::from_utf8_lossy(&buf).trim().to_string();
                    buf.clear();
                    if line.is_empty() {
                        return None;
                    }
                    return Some((Ok(line), (bytes, buf, finished)));
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        let err = GfError::GenerationUnavailable {
                            provider: provider.to_string(),
                            message: format!("stream interrupted: {e}"),
                        };
                        // 出错后丢弃残留数据并结束
                        buf.clear();
                        return Some((Err(err), (bytes, buf, true)));
                    }
                    None => finished = true,
                }
            }
        },
    )
    .boxed()
}
