use super::{NodeStatus, PeerTransport};
use crate::api::auth::basic_header;
use crate::api::Envelope;
use crate::configs::{AuthConfig, PeerConfig};
use crate::error::PeerError;
use crate::process::types::{Control, ProgramState};
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Talks to peers over their control api, using the same envelope.
pub struct HttpTransport {
    client: Client<HttpConnector, Full<Bytes>>,
    authorization: Option<String>,
}

impl HttpTransport {
    /// Peers are expected to share our credentials, if any.
    pub fn new(auth: Option<&AuthConfig>) -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            authorization: auth.map(basic_header),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        peer: &PeerConfig,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<T, PeerError> {
        let unreachable = |reason: String| PeerError::Unreachable {
            peer: peer.id.clone(),
            reason,
        };
        let uri: Uri = format!("{}{}", peer.url.trim_end_matches('/'), path)
            .parse()
            .map_err(|err| unreachable(format!("invalid url: {err}")))?;
        debug!(peer = %peer.id, %method, %uri, "Peer request");

        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json");
        if let Some(authorization) = &self.authorization {
            builder = builder.header(AUTHORIZATION, authorization.as_str());
        }
        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|err| unreachable(err.to_string()))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|err| unreachable(err.to_string()))?;
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|err| unreachable(err.to_string()))?
            .to_bytes();

        decode(&peer.id, &bytes)
    }
}

/// Unwraps an envelope, turning non-zero statuses into [`PeerError::Remote`].
fn decode<T: DeserializeOwned>(peer: &str, bytes: &[u8]) -> Result<T, PeerError> {
    let remote = |code: i32, message: String| PeerError::Remote {
        peer: peer.to_string(),
        code,
        message,
    };
    let envelope: Envelope<serde_json::Value> = serde_json::from_slice(bytes)
        .map_err(|err| remote(-1, format!("malformed response: {err}")))?;
    if envelope.status != 0 {
        let message = match envelope.value {
            serde_json::Value::String(message) => message,
            other => other.to_string(),
        };
        return Err(remote(envelope.status, message));
    }
    serde_json::from_value(envelope.value)
        .map_err(|err| remote(-1, format!("unexpected payload: {err}")))
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn fetch_status(&self, peer: &PeerConfig) -> Result<NodeStatus, PeerError> {
        self.call(peer, Method::GET, "/distributed/status", None).await
    }

    async fn push_status(&self, peer: &PeerConfig, status: &NodeStatus) -> Result<(), PeerError> {
        let body = serde_json::to_vec(status).map_err(|err| PeerError::Unreachable {
            peer: peer.id.clone(),
            reason: err.to_string(),
        })?;
        let _: bool = self
            .call(peer, Method::POST, "/distributed/status", Some(body))
            .await?;
        Ok(())
    }

    async fn send_command(
        &self,
        peer: &PeerConfig,
        program: &str,
        control: Control,
    ) -> Result<ProgramState, PeerError> {
        let path = format!("/api/programs/{program}/{control}");
        self.call(peer, Method::POST, &path, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_success_payload() {
        let state: ProgramState = decode("b", br#"{"status":0,"value":"running"}"#).unwrap();
        assert_eq!(state, ProgramState::Running);
    }

    #[test]
    fn remote_errors_keep_code_and_message() {
        let err = decode::<ProgramState>("b", br#"{"status":3,"value":"cannot start"}"#).unwrap_err();
        assert_eq!(
            err,
            PeerError::Remote {
                peer: "b".into(),
                code: 3,
                message: "cannot start".into()
            }
        );
    }

    #[test]
    fn garbage_is_a_remote_error() {
        let err = decode::<ProgramState>("b", b"<html>").unwrap_err();
        assert!(matches!(err, PeerError::Remote { code: -1, .. }));
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new(None);
        let peer = PeerConfig {
            id: "gone".into(),
            url: format!("http://{address}"),
        };
        let err = transport.fetch_status(&peer).await.unwrap_err();
        assert!(matches!(err, PeerError::Unreachable { .. }), "{err:?}");
    }
}
