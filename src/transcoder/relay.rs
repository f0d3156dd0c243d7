use super::StreamTranscoder;
use crate::models::{MessagesResponse, StreamEvent};
use crate::providers::ChunkStream;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;

/// How a relayed stream ended
#[derive(Debug)]
pub enum RelayOutcome {
    /// `message_stop` sent; the assembled message is attached for logging
    Completed(MessagesResponse),
    /// Terminated with an `error` event. `transport` is set when the upstream
    /// connection itself failed, as opposed to malformed content.
    Failed { message: String, transport: bool },
    /// The client went away; upstream was dropped unread
    ClientGone,
}

async fn send_all(sender: &mpsc::Sender<Bytes>, events: Vec<StreamEvent>) -> Result<(), ()> {
    for event in events {
        sender.send(Bytes::from(event.to_sse())).await.map_err(|_| ())?;
    }
    Ok(())
}

/// Drive `transcoder` from `upstream` into `sender` as SSE frames.
///
/// Reading stops as soon as the receiving side closes; the upstream stream is
/// dropped on return, which releases its connection.
pub async fn relay(mut upstream: ChunkStream, mut transcoder: StreamTranscoder, sender: mpsc::Sender<Bytes>) -> RelayOutcome {
    let mut transport_failure = false;

    loop {
        let next = tokio::select! {
            biased;
            _ = sender.closed() => {
                tracing::debug!("Client disconnected, dropping upstream stream");
                return RelayOutcome::ClientGone;
            }
            next = upstream.next() => next,
        };

        let events = match next {
            Some(Ok(chunk)) => transcoder.push(&chunk),
            Some(Err(e)) => {
                tracing::warn!(error_kind = e.kind(), "Upstream stream failed mid-response: {}", e);
                transport_failure = true;
                transcoder.fail(&e.to_string())
            }
            None => transcoder.finish(),
        };

        if send_all(&sender, events).await.is_err() {
            tracing::debug!("Client disconnected, dropping upstream stream");
            return RelayOutcome::ClientGone;
        }

        if transcoder.is_done() {
            break;
        }
    }

    match transcoder.failure() {
        Some(message) => RelayOutcome::Failed {
            message: message.to_string(),
            transport: transport_failure,
        },
        None => RelayOutcome::Completed(transcoder.to_response()),
    }
}
