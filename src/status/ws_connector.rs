//! WebSocket implementation of [`StatusConnector`].

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};

use super::observer::{ChannelLink, InboundFrame, ObserverError, OutboundFrame, StatusConnector};

const LINK_BUFFER: usize = 64;

/// Connects to a routelane status channel, e.g.
/// `ws://127.0.0.1:3456/api/rules/status`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl StatusConnector for WsConnector {
    fn connect(&self) -> BoxFuture<'static, Result<ChannelLink, ObserverError>> {
        let url = self.url.clone();
        Box::pin(async move {
            let (ws_stream, _) = connect_async(url.as_str())
                .await
                .map_err(|e| ObserverError::Connect(e.to_string()))?;
            tracing::debug!(url = %url, "Status websocket open");

            let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(LINK_BUFFER);
            let (in_tx, in_rx) = mpsc::channel::<InboundFrame>(LINK_BUFFER);
            let (mut write, mut read) = ws_stream.split();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        outbound = out_rx.recv() => match outbound {
                            Some(OutboundFrame::Text(text)) => {
                                if let Err(e) = write.send(Message::Text(text)).await {
                                    tracing::debug!(error = %e, "Status websocket write failed");
                                    let _ = in_tx.send(InboundFrame::Closed(None)).await;
                                    return;
                                }
                            }
                            Some(OutboundFrame::Close(code)) => {
                                let frame = CloseFrame {
                                    code: CloseCode::from(code),
                                    reason: "".into(),
                                };
                                let _ = write.send(Message::Close(Some(frame))).await;
                                return;
                            }
                            // Manager side went away.
                            None => {
                                let _ = write.close().await;
                                return;
                            }
                        },
                        inbound = read.next() => match inbound {
                            Some(Ok(Message::Text(text))) => {
                                if in_tx.send(InboundFrame::Text(text)).await.is_err() {
                                    return;
                                }
                            }
                            Some(Ok(Message::Close(frame))) => {
                                let code = frame.map(|f| u16::from(f.code));
                                let _ = in_tx.send(InboundFrame::Closed(code)).await;
                                return;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::debug!(error = %e, "Status websocket read failed");
                                let _ = in_tx.send(InboundFrame::Closed(None)).await;
                                return;
                            }
                            None => {
                                let _ = in_tx.send(InboundFrame::Closed(None)).await;
                                return;
                            }
                        },
                    }
                }
            });

            Ok(ChannelLink {
                outbound: out_tx,
                inbound: in_rx,
            })
        })
    }
}
