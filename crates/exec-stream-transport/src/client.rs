//! Client side: dial an exec endpoint.

use async_trait::async_trait;
use bytes::Bytes;
use exec_stream_core::{FrameSink, FrameSource, Transport, TransportError};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use url::Url;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dial error.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Build the URL to dial: `http`/`https` become `ws`/`wss`, and the command
/// and tty parameters replace any already present.
///
/// # Errors
/// Returns error if `socket_url` does not parse or has a non-web scheme.
pub fn dial_url(socket_url: &str, command: &[String], tty: bool) -> Result<Url, DialError> {
    let mut url = Url::parse(socket_url)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(DialError::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|()| DialError::UnsupportedScheme(scheme.to_string()))?;

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| key != "command" && key != "tty")
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .extend_pairs(command.iter().map(|arg| ("command", arg)))
        .append_pair("tty", if tty { "true" } else { "false" });
    Ok(url)
}

/// Connect to an exec endpoint and return the frame transport.
///
/// # Errors
/// Returns error if the URL is invalid or the handshake fails.
pub async fn dial(socket_url: &str, command: &[String], tty: bool) -> Result<Transport, DialError> {
    let url = dial_url(socket_url, command, tty)?;
    if url.scheme() == "wss" {
        // Fails harmlessly when a provider is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();
    }
    tracing::debug!(%url, "Dialing exec endpoint");
    let (socket, _response) = connect_async(url.as_str()).await?;
    let (sink, source) = socket.split();
    Ok(Transport::new(ClientSink(sink), ClientSource(source)))
}

struct ClientSink(SplitSink<Socket, Message>);

struct ClientSource(SplitStream<Socket>);

#[async_trait]
impl FrameSink for ClientSink {
    async fn send(&mut self, message: Bytes) -> Result<(), TransportError> {
        self.0
            .send(Message::Binary(message.to_vec()))
            .await
            .map_err(|e| TransportError::Other(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.0
            .close()
            .await
            .map_err(|e| TransportError::Other(e.to_string()))
    }
}

#[async_trait]
impl FrameSource for ClientSource {
    async fn recv(&mut self) -> Option<Result<Bytes, TransportError>> {
        loop {
            match self.0.next().await? {
                Ok(Message::Binary(data)) => return Some(Ok(Bytes::from(data))),
                Ok(Message::Close(_)) => return None,
                Ok(Message::Text(_)) => tracing::debug!("Ignoring text message"),
                Ok(_) => {}
                Err(e) => return Some(Err(TransportError::Other(e.to_string()))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(url: &Url) -> Vec<(String, String)> {
        url.query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[test]
    fn test_dial_url_rewrites_scheme() {
        let url = dial_url("http://localhost:8080/abc/shell.sock", &[], false).unwrap();
        assert_eq!(url.scheme(), "ws");
        assert_eq!(url.path(), "/abc/shell.sock");

        let url = dial_url("https://example.com/shell.sock", &[], true).unwrap();
        assert_eq!(url.scheme(), "wss");

        assert!(matches!(
            dial_url("ftp://example.com/shell.sock", &[], true),
            Err(DialError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            dial_url("not a url", &[], true),
            Err(DialError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_dial_url_replaces_command() {
        let command = vec!["sh".to_string(), "-c".to_string(), "echo a&b".to_string()];
        let url = dial_url(
            "ws://host/shell.sock?command=old&tty=false&token=abc",
            &command,
            true,
        )
        .unwrap();
        assert_eq!(
            query(&url),
            vec![
                ("token".to_string(), "abc".to_string()),
                ("command".to_string(), "sh".to_string()),
                ("command".to_string(), "-c".to_string()),
                ("command".to_string(), "echo a&b".to_string()),
                ("tty".to_string(), "true".to_string()),
            ]
        );
    }

    #[cfg(feature = "websocket")]
    mod end_to_end {
        use exec_stream_core::{
            CallerEndpoint, ExitStatus, ProcessEndpoint, ProcessError, ProcessHandle,
            SessionConfig,
        };
        use exec_stream_session::{SessionController, SessionState};
        use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

        use super::*;
        use crate::websocket::{ExecLauncher, ExecRequest, ExecState, create_exec_router};

        struct Exited;

        #[async_trait]
        impl ProcessHandle for Exited {
            async fn wait(&mut self) -> Result<ExitStatus, ProcessError> {
                Ok(ExitStatus::from_code(0))
            }

            fn kill(&mut self) -> Result<(), ProcessError> {
                Ok(())
            }
        }

        /// Prints its own request and exits.
        struct EchoLauncher;

        #[async_trait]
        impl ExecLauncher for EchoLauncher {
            async fn launch(&self, request: &ExecRequest) -> Result<ProcessEndpoint, ProcessError> {
                if request.command.first().map(String::as_str) == Some("missing") {
                    return Err(ProcessError::Other("no such program".into()));
                }
                let (mut tx, rx) = duplex(1024);
                let line = format!("{} tty={}", request.command.join(" "), request.tty);
                tx.write_all(line.as_bytes()).await?;
                Ok(ProcessEndpoint::new(Exited).stdout(rx))
            }
        }

        async fn start_server() -> String {
            start_server_with(SessionConfig::default()).await
        }

        async fn start_server_with(config: SessionConfig) -> String {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let app = create_exec_router(ExecState::new(EchoLauncher, config));
            tokio::spawn(async move { axum::serve(listener, app).await });
            format!("http://{addr}/shell.sock")
        }

        #[tokio::test]
        async fn test_attach_over_websocket() {
            let url = start_server().await;
            let command = vec!["echo".to_string(), "hi".to_string()];
            let transport = dial(&url, &command, true).await.unwrap();

            let (stdout_sink, mut stdout) = duplex(1024);
            let controller = SessionController::new(SessionConfig::default()).unwrap();
            let state = controller
                .attach(transport, CallerEndpoint::new().stdout(stdout_sink))
                .await;
            assert_eq!(state, SessionState::Stopped(ExitStatus::from_code(0)));

            let mut received = String::new();
            stdout.read_to_string(&mut received).await.unwrap();
            assert_eq!(received, "echo hi tty=true");
        }

        #[tokio::test]
        async fn test_launch_failure_reports_error() {
            let url = start_server().await;
            let transport = dial(&url, &["missing".to_string()], false).await.unwrap();

            let controller = SessionController::new(SessionConfig::default()).unwrap();
            let state = controller.attach(transport, CallerEndpoint::new()).await;
            match state {
                SessionState::Errored { message } => assert!(message.contains("no such program")),
                other => panic!("unexpected state: {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_https_dials_with_tls() {
            use tokio_tungstenite::tungstenite::error::{Error as WsError, UrlError};

            let url = start_server().await.replacen("http://", "https://", 1);
            // The server speaks plain HTTP, so the TLS handshake itself fails.
            match dial(&url, &[], false).await {
                Err(DialError::WebSocket(WsError::Url(UrlError::TlsFeatureNotEnabled))) => {
                    panic!("TLS support is missing")
                }
                Err(DialError::WebSocket(_)) => {}
                Err(other) => panic!("unexpected error: {other}"),
                Ok(_) => panic!("handshake unexpectedly succeeded"),
            }
        }

        #[tokio::test]
        async fn test_invalid_server_config_reports_error() {
            let url = start_server_with(SessionConfig {
                max_frame_payload: Some(0),
                ..SessionConfig::default()
            })
            .await;
            let transport = dial(&url, &["echo".to_string()], false).await.unwrap();

            let controller = SessionController::new(SessionConfig::default()).unwrap();
            let state = controller.attach(transport, CallerEndpoint::new()).await;
            match state {
                SessionState::Errored { message } => {
                    assert!(message.contains("Invalid session config"));
                }
                other => panic!("unexpected state: {other:?}"),
            }
        }
    }
}
