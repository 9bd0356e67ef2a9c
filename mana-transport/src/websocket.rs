//! WebSocket carrier: a [`TransportBinding`] over tokio-tungstenite that
//! negotiates the `mana.v1` subprotocol and samples its outbound queue
//! for backpressure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::binding::{
    register, CloseCallback, CloseSummary, DataCallback, Disposer, ErrorCallback, Registry,
    TransportBinding,
};
use crate::{TransportError, SUBPROTOCOL};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct WsBinding {
    outbound_tx: UnboundedSender<Bytes>,
    data: Registry<DataCallback>,
    close: Registry<CloseCallback>,
    errors: Registry<ErrorCallback>,
    ids: Arc<AtomicU64>,
    buffered: Arc<AtomicU64>,
    _pump: JoinHandle<()>,
}

impl WsBinding {
    /// Dial `url` and upgrade with the `mana.v1` subprotocol. Fails if
    /// the server does not accept it.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(TransportError::WebSocket)?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(SUBPROTOCOL),
        );
        let (stream, response) = connect_async(request).await?;
        let accepted = response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|value| value.to_str().ok());
        if accepted != Some(SUBPROTOCOL) {
            return Err(TransportError::Protocol(format!(
                "server accepted subprotocol {accepted:?}, not {SUBPROTOCOL:?}"
            )));
        }
        info!(url, "websocket carrier connected");
        Ok(Self::from_stream(stream))
    }

    fn from_stream(stream: WsStream) -> Self {
        let (outbound_tx, outbound_rx) = unbounded_channel();
        let data: Registry<DataCallback> = Arc::new(Mutex::new(HashMap::new()));
        let close: Registry<CloseCallback> = Arc::new(Mutex::new(HashMap::new()));
        let errors: Registry<ErrorCallback> = Arc::new(Mutex::new(HashMap::new()));
        let buffered = Arc::new(AtomicU64::new(0));

        let pump = tokio::spawn(pump(
            stream,
            outbound_rx,
            data.clone(),
            close.clone(),
            errors.clone(),
            buffered.clone(),
        ));

        WsBinding {
            outbound_tx,
            data,
            close,
            errors,
            ids: Arc::new(AtomicU64::new(0)),
            buffered,
            _pump: pump,
        }
    }
}

impl TransportBinding for WsBinding {
    fn send(&mut self, bytes: Bytes) -> Result<(), TransportError> {
        self.buffered
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.outbound_tx
            .send(bytes)
            .map_err(|_| TransportError::Closed)
    }

    fn on_data(&mut self, callback: DataCallback) -> Disposer {
        register(&self.data, &self.ids, callback)
    }

    fn on_close(&mut self, callback: CloseCallback) -> Disposer {
        register(&self.close, &self.ids, callback)
    }

    fn on_error(&mut self, callback: ErrorCallback) -> Disposer {
        register(&self.errors, &self.ids, callback)
    }

    fn buffered_bytes(&self) -> u64 {
        self.buffered.load(Ordering::Relaxed)
    }
}

fn notify_close(close: &Registry<CloseCallback>, summary: CloseSummary) {
    let mut callbacks = close.lock().unwrap_or_else(|e| e.into_inner());
    for callback in callbacks.values_mut() {
        callback(summary.clone());
    }
}

async fn pump(
    stream: WsStream,
    mut outbound_rx: UnboundedReceiver<Bytes>,
    data: Registry<DataCallback>,
    close: Registry<CloseCallback>,
    errors: Registry<ErrorCallback>,
    buffered: Arc<AtomicU64>,
) {
    let (mut sink, mut source) = stream.split();
    loop {
        tokio::select! {
            maybe_bytes = outbound_rx.recv() => {
                match maybe_bytes {
                    Some(bytes) => {
                        let len = bytes.len() as u64;
                        let result = sink.send(Message::Binary(bytes)).await;
                        buffered.fetch_sub(len, Ordering::Relaxed);
                        if let Err(error) = result {
                            warn!(%error, "websocket send failed");
                            let mut callbacks = errors.lock().unwrap_or_else(|e| e.into_inner());
                            for callback in callbacks.values_mut() {
                                callback(TransportError::Protocol(error.to_string()));
                            }
                            notify_close(&close, CloseSummary::default());
                            break;
                        }
                    }
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            maybe_message = source.next() => {
                match maybe_message {
                    Some(Ok(Message::Binary(payload))) => {
                        let mut callbacks = data.lock().unwrap_or_else(|e| e.into_inner());
                        for callback in callbacks.values_mut() {
                            callback(Bytes::from(payload.clone()));
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let summary = frame
                            .map(|f| CloseSummary {
                                code: Some(f.code.into()),
                                reason: Some(f.reason.to_string()),
                            })
                            .unwrap_or_default();
                        debug!(?summary, "websocket closed by peer");
                        notify_close(&close, summary);
                        break;
                    }
                    // Ping/pong are handled inside tungstenite; text
                    // frames are not part of the mana.v1 envelope.
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        warn!(%error, "websocket read failed");
                        let mut callbacks = errors.lock().unwrap_or_else(|e| e.into_inner());
                        for callback in callbacks.values_mut() {
                            callback(TransportError::Protocol(error.to_string()));
                        }
                        notify_close(&close, CloseSummary::default());
                        break;
                    }
                    None => {
                        notify_close(&close, CloseSummary::default());
                        break;
                    }
                }
            }
        }
    }
}
