//! JSON envelope shim for hosted pages.
//!
//! A page-side fetch shim posts `{id, request}` envelopes; each comes
//! back as `{id, response}` or `{id, error}`. The envelope id space
//! belongs to the page and is echoed verbatim; it is unrelated to the
//! host <-> worker correlation counter.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use vessel_protocol::http::port_from_url;
use vessel_protocol::{HttpRequest, HttpResponse};

use crate::container::Container;

#[derive(Debug, Deserialize)]
struct Envelope {
    id: Value,
    request: HttpRequest,
    #[serde(default)]
    port: Option<u16>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum EnvelopeReply {
    Response { id: Value, response: HttpResponse },
    Error { id: Value, error: String },
}

/// Forwards page requests into the container and synthesizes replies.
pub struct NetworkInterceptor {
    container: Arc<Container>,
}

impl NetworkInterceptor {
    pub fn new(container: Arc<Container>) -> Self {
        Self { container }
    }

    /// Handle one raw envelope. Always returns a serializable reply;
    /// malformed input gets a null-id error envelope.
    pub async fn handle_message(&self, raw: &str) -> String {
        let reply = match serde_json::from_str::<Envelope>(raw) {
            Ok(envelope) => {
                let port = envelope
                    .port
                    .unwrap_or_else(|| port_from_url(&envelope.request.url));
                match self.container.fetch(envelope.request, port).await {
                    Ok(response) => EnvelopeReply::Response {
                        id: envelope.id,
                        response,
                    },
                    Err(err) => EnvelopeReply::Error {
                        id: envelope.id,
                        error: err.to_string(),
                    },
                }
            }
            Err(err) => EnvelopeReply::Error {
                id: Value::Null,
                error: format!("invalid intercept envelope: {}", err),
            },
        };
        // The reply enums only hold JSON-safe values.
        serde_json::to_string(&reply).unwrap_or_else(|err| {
            format!("{{\"id\":null,\"error\":\"{}\"}}", err)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_envelope_produces_null_id_error() {
        let parsed: Result<Envelope, _> = serde_json::from_str("{\"nope\":1}");
        assert!(parsed.is_err());
    }

    #[test]
    fn envelope_accepts_string_and_numeric_ids() {
        let raw = r#"{"id":"abc","request":{"method":"GET","url":"http://localhost:8080/"}}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.id, Value::String("abc".to_string()));
        assert_eq!(envelope.port, None);

        let raw = r#"{"id":7,"request":{"method":"GET","url":"/x"},"port":3000}"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.id, Value::from(7));
        assert_eq!(envelope.port, Some(3000));
    }
}
