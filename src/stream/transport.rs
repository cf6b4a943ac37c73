//! Transport seam between the stream state machine and socket I/O.
//!
//! A [`Connector`] opens one connection per call and hands back a pair of
//! channels. The client never touches the socket directly: it writes encoded
//! payloads into `outbound` and reads raw frames from `inbound`. Dropping the
//! outbound sender closes the connection; the inbound receiver yields `None`
//! once the peer or the network ends it.

use std::sync::Once;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::stream::client::StreamClientError;

/// Channel pair for one live connection.
#[derive(Debug)]
pub struct TransportChannels {
    /// Encoded outbound payloads. Dropping this closes the connection.
    pub outbound: mpsc::UnboundedSender<String>,
    /// Raw inbound frames in wire order; ends when the connection closes.
    pub inbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Opens connections to an endpoint.
pub trait Connector: Send + Sync + 'static {
    /// Starts one connection attempt.
    ///
    /// The returned future resolves once the connection is established or the
    /// attempt has failed.
    fn connect(
        &self,
        endpoint: &str,
    ) -> BoxFuture<'static, Result<TransportChannels, StreamClientError>>;
}

/// Production connector backed by `tokio-tungstenite`.
#[derive(Clone, Debug, Default)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn connect(
        &self,
        endpoint: &str,
    ) -> BoxFuture<'static, Result<TransportChannels, StreamClientError>> {
        install_crypto_provider();
        let endpoint = endpoint.to_string();
        Box::pin(async move {
            let request = endpoint
                .as_str()
                .into_client_request()
                .map_err(|err| StreamClientError::InvalidEndpoint(format!("{endpoint}: {err}")))?;
            let (socket, _) = connect_async(request).await?;

            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            tokio::spawn(pump_socket(socket, outbound_rx, inbound_tx));

            Ok::<_, StreamClientError>(TransportChannels {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        })
    }
}

/// Installs the `ring` provider as the process default so `wss://` handshakes
/// can build a TLS config. An already installed provider is kept.
fn install_crypto_provider() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!(event = "stream_tls_provider_already_installed");
        }
    });
}

/// Moves frames between the socket and the connection channels until either
/// side goes away.
async fn pump_socket<S>(
    mut socket: WebSocketStream<S>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            maybe_outbound = outbound_rx.recv() => {
                match maybe_outbound {
                    Some(text) => {
                        if let Err(err) = socket.send(Message::Text(text)).await {
                            warn!(event = "stream_socket_send_failed", error = %err);
                            break;
                        }
                    }
                    None => {
                        let _ = socket.close(None).await;
                        debug!(event = "stream_socket_closed_locally");
                        return;
                    }
                }
            }
            maybe_inbound = socket.next() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(text))) => {
                        if inbound_tx.send(text.into_bytes()).is_err() {
                            let _ = socket.close(None).await;
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if inbound_tx.send(data).is_err() {
                            let _ = socket.close(None).await;
                            return;
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        debug!(event = "stream_socket_closed_by_peer", frame = ?frame);
                        break;
                    }
                    Some(Err(err)) => {
                        warn!(event = "stream_socket_error", error = %err);
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Connector, WebSocketConnector};
    use crate::stream::client::StreamClientError;

    #[tokio::test]
    async fn malformed_endpoint_is_reported_as_invalid() {
        let result = WebSocketConnector.connect("not a websocket url").await;
        match result {
            Err(StreamClientError::InvalidEndpoint(detail)) => {
                assert!(detail.starts_with("not a websocket url"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unsupported_scheme_fails_attempt() {
        let result = WebSocketConnector.connect("ftp://127.0.0.1:1/live").await;
        assert!(matches!(
            result,
            Err(StreamClientError::InvalidEndpoint(_)) | Err(StreamClientError::WebSocket(_))
        ));
    }
}
