//! Chat pipeline seam and event-stream aggregation.
//!
//! The pipeline answers a [`ChatRequest`] with a channel of [`ChatEvent`]s.
//! [`collect_response`] folds that stream into one string for synchronous
//! tool calls.

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::fmt::Display;
use reqwest::Client;
use tokio::sync::mpsc;

use crate::domain::{ChatEvent, ChatEventKind, ChatRequest};
use crate::error::{BridgeError, Result};

/// Buffer between a pipeline producer and its consumer.
pub const EVENT_BUFFER: usize = 32;

/// Streaming chat pipeline.
///
/// Implementations must stop producing once the receiver is dropped; the
/// consumer stops reading after the first `done` or `error` event and never
/// drains the rest.
#[async_trait]
pub trait ChatPipeline: Send + Sync {
    async fn submit(&self, request: ChatRequest) -> Result<mpsc::Receiver<ChatEvent>>;
}

/// Fold a chat event stream into the full answer.
///
/// `data` events are concatenated in arrival order. The first `error` event
/// wins over any text collected so far. The loop ends on `done`, on `error`,
/// or when the producer closes the channel. An empty answer is an error.
///
/// Dropping the returned future drops the receiver, which is how cancellation
/// reaches the producer.
pub async fn collect_response(mut events: mpsc::Receiver<ChatEvent>) -> Result<String> {
    let mut response = String::new();

    while let Some(event) = events.recv().await {
        match event.kind {
            ChatEventKind::Error => return Err(BridgeError::Pipeline(event.content)),
            ChatEventKind::Data => response.push_str(&event.content),
            ChatEventKind::Done => break,
        }
    }

    if response.is_empty() {
        return Err(BridgeError::EmptyResponse);
    }
    Ok(response)
}

/// Incremental decoder for `text/event-stream` bodies carrying JSON events.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns the events completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<ChatEvent>> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);

            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim_start();
            if payload.is_empty() {
                continue;
            }
            events.push(
                serde_json::from_str::<ChatEvent>(payload)
                    .map_err(|e| BridgeError::Pipeline(format!("malformed event: {}", e))),
            );
        }
        events
    }
}

/// Decode an SSE body into `tx` until a terminal event is forwarded, the
/// body ends, or the receiver is dropped.
///
/// A body that stays open after `done` no longer holds the sender, and a
/// dropped receiver is noticed even while the body is idle.
pub(crate) async fn forward_events<S, B, E>(body: S, tx: mpsc::Sender<ChatEvent>, kb_id: String)
where
    S: Stream<Item = std::result::Result<B, E>>,
    B: AsRef<[u8]>,
    E: Display,
{
    let mut body = std::pin::pin!(body);
    let mut decoder = SseDecoder::new();

    loop {
        let chunk = tokio::select! {
            _ = tx.closed() => {
                tracing::debug!(%kb_id, "chat consumer went away, closing stream");
                return;
            }
            chunk = body.next() => chunk,
        };
        let chunk = match chunk {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                let _ = tx.send(ChatEvent::error(e.to_string())).await;
                return;
            }
            None => return,
        };
        for event in decoder.push(chunk.as_ref()) {
            let event = event.unwrap_or_else(|e| ChatEvent::error(e.to_string()));
            let terminal = matches!(event.kind, ChatEventKind::Done | ChatEventKind::Error);
            if tx.send(event).await.is_err() {
                tracing::debug!(%kb_id, "chat consumer went away, closing stream");
                return;
            }
            if terminal {
                return;
            }
        }
    }
}

/// Chat pipeline reached over HTTP, answering with server-sent events.
pub struct HttpChatPipeline {
    client: Client,
    url: String,
}

impl HttpChatPipeline {
    pub fn new(url: &str) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| BridgeError::upstream("chat pipeline", e))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl ChatPipeline for HttpChatPipeline {
    async fn submit(&self, request: ChatRequest) -> Result<mpsc::Receiver<ChatEvent>> {
        let resp = self
            .client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&request)
            .send()
            .await
            .map_err(|e| BridgeError::upstream("chat pipeline", e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BridgeError::upstream(
                "chat pipeline",
                format!("HTTP {}: {}", status, body),
            ));
        }

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(forward_events(resp.bytes_stream(), tx, request.kb_id));
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn feed(events: Vec<ChatEvent>) -> Result<String> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        for event in events {
            tx.send(event).await.unwrap();
        }
        drop(tx);
        collect_response(rx).await
    }

    #[tokio::test]
    async fn concatenates_data_in_order() {
        let out = feed(vec![ChatEvent::data("A"), ChatEvent::data("B"), ChatEvent::done()]).await;
        assert_eq!(out.unwrap(), "AB");
    }

    #[tokio::test]
    async fn error_discards_partial_text() {
        let out = feed(vec![ChatEvent::data("A"), ChatEvent::error("x")]).await;
        match out {
            Err(BridgeError::Pipeline(msg)) => assert_eq!(msg, "x"),
            other => panic!("expected pipeline error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn done_alone_is_empty() {
        let out = feed(vec![ChatEvent::done()]).await;
        assert!(matches!(out, Err(BridgeError::EmptyResponse)));
    }

    #[tokio::test]
    async fn stops_at_done_without_draining() {
        let out = feed(vec![
            ChatEvent::data("A"),
            ChatEvent::done(),
            ChatEvent::error("late"),
            ChatEvent::data("B"),
        ])
        .await;
        assert_eq!(out.unwrap(), "A");
    }

    #[tokio::test]
    async fn closed_channel_ends_the_stream() {
        let out = feed(vec![ChatEvent::data("partial")]).await;
        assert_eq!(out.unwrap(), "partial");
    }

    #[tokio::test]
    async fn producer_sees_consumer_stop() {
        let (tx, rx) = mpsc::channel(1);
        let producer = tokio::spawn(async move {
            tx.send(ChatEvent::done()).await.unwrap();
            let _ = tx.send(ChatEvent::data("never read")).await;
            // Buffer is full or closed; only the dropped receiver releases it.
            tx.send(ChatEvent::data("never read")).await.is_err()
        });
        let out = collect_response(rx).await;
        assert!(matches!(out, Err(BridgeError::EmptyResponse)));
        assert!(producer.await.unwrap());
    }

    fn sse(lines: &[&str]) -> Vec<std::result::Result<Vec<u8>, String>> {
        lines.iter().map(|l| Ok(format!("{}\n", l).into_bytes())).collect()
    }

    #[tokio::test]
    async fn forwarding_stops_after_done_on_an_open_body() {
        let body = futures::stream::iter(sse(&[
            r#"data: {"type":"data","content":"hi"}"#,
            r#"data: {"type":"done"}"#,
        ]))
        .chain(futures::stream::pending());
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let producer = tokio::spawn(forward_events(body, tx, "kb1".to_string()));

        assert_eq!(rx.recv().await, Some(ChatEvent::data("hi")));
        assert_eq!(rx.recv().await, Some(ChatEvent::done()));
        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert_eq!(closed.unwrap(), None);
        tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn forwarding_notices_a_dropped_receiver_on_an_idle_body() {
        let body = futures::stream::iter(sse(&[r#"data: {"type":"data","content":"a"}"#]))
            .chain(futures::stream::pending());
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let producer = tokio::spawn(forward_events(body, tx, "kb1".to_string()));

        assert_eq!(rx.recv().await, Some(ChatEvent::data("a")));
        drop(rx);
        tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn transport_errors_become_error_events() {
        let body = futures::stream::iter(vec![Err::<Vec<u8>, _>("connection reset".to_string())]);
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        forward_events(body, tx, "kb1".to_string()).await;

        match collect_response(rx).await {
            Err(BridgeError::Pipeline(msg)) => assert_eq!(msg, "connection reset"),
            other => panic!("expected pipeline error, got {:?}", other),
        }
    }

    #[test]
    fn sse_decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"type\":\"da").is_empty());
        let events = decoder.push(b"ta\",\"content\":\"h\xc3").into_iter().count();
        assert_eq!(events, 0);
        let events: Vec<ChatEvent> = decoder
            .push(b"\xa9\"}\r\n\nevent: ping\ndata: {\"type\":\"done\"}\n")
            .into_iter()
            .map(|e| e.unwrap())
            .collect();
        assert_eq!(events, vec![ChatEvent::data("h\u{e9}"), ChatEvent::done()]);
    }

    #[test]
    fn sse_decoder_reports_malformed_payloads() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"data: not json\n");
        assert_eq!(events.len(), 1);
        assert!(events[0].is_err());
    }
}
