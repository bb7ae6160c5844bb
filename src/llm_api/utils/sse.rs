//! # SSE 解码
//!
//! 基于 eventsource-stream 把响应字节流切分为 SSE 事件，
//! 再交给各供应商的 `SseDecoder` 转换成 `StreamChunk`。

use async_stream::stream;
use eventsource_stream::{Event, EventStreamError, Eventsource};
use futures_util::{Stream, StreamExt};
use reqwest::Response;
use tracing::debug;

use crate::llm_api::error::AiError;
use crate::models::chat::StreamChunk;

/// 把某个供应商的 SSE 事件翻译为归一化块
pub trait SseDecoder: Send {
    /// 处理一个事件。返回的块里最多包含一个终止块，且必须位于末尾
    fn on_event(&mut self, event: &Event) -> Vec<StreamChunk>;

    /// 连接结束但还没有产出终止块时调用，必须返回终止块
    fn on_end(&mut self) -> StreamChunk;
}

/// 响应字节流 → SSE 事件流
pub fn sse_events(response: Response) -> impl Stream<Item = Result<Event, AiError>> + Send {
    response.bytes_stream().eventsource().map(|item| {
        item.map_err(|e| match e {
            EventStreamError::Transport(e) => AiError::Network(format!("Stream error: {}", e)),
            other => AiError::Protocol(format!("Malformed SSE stream: {}", other)),
        })
    })
}

/// 用解码器驱动事件流，保证恰好产出一个终止块
pub fn decode_events<S, D>(events: S, mut decoder: D) -> impl Stream<Item = StreamChunk> + Send
where
    S: Stream<Item = Result<Event, AiError>> + Send + 'static,
    D: SseDecoder + 'static,
{
    stream! {
        let mut events = Box::pin(events);
        while let Some(item) = events.next().await {
            match item {
                Ok(event) => {
                    for chunk in decoder.on_event(&event) {
                        if chunk.is_empty_delta() {
                            continue;
                        }
                        let terminal = chunk.finished;
                        yield chunk;
                        if terminal {
                            return;
                        }
                    }
                }
                Err(error) => {
                    debug!(error = %error, "SSE stream aborted");
                    yield StreamChunk::failed(error);
                    return;
                }
            }
        }
        yield decoder.on_end();
    }
}
