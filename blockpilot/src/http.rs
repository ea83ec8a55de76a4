use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::Value;
use tracing::debug;

use crate::client::{Method, RemoteCommand, RemoteCommandClient, RemoteResponse, Transport};
use crate::errors::RemoteError;

/// JSON-over-HTTP transport for the automation service.
///
/// No request timeout is configured: the only timeout is the one carried in
/// wait-for-element payloads, so a hung service hangs the call.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self, RemoteError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| RemoteError::new(format!("Invalid server URL '{base_url}': {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(RemoteError::new(format!(
                "Invalid server URL '{base_url}': cannot be a base"
            )));
        }
        Ok(Self {
            client: Client::new(),
            base_url,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url_for(&self, command: &RemoteCommand) -> Result<Url, RemoteError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| RemoteError::new(format!("Invalid server URL '{}'", self.base_url)))?
            .pop_if_empty()
            .extend(command.path.iter().map(String::as_str));
        Ok(url)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, command: &RemoteCommand) -> Result<RemoteResponse, RemoteError> {
        let url = self.url_for(command)?;
        let request = match command.method {
            Method::Get => self.client.get(url),
            Method::Post => self.client.post(url),
            Method::Delete => self.client.delete(url),
        };
        let request = match &command.payload {
            Some(payload) => request.json(payload),
            None => request,
        };

        let response = request.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        // Acks may come back empty or as plain text.
        let body = serde_json::from_str(&text).unwrap_or(Value::Null);
        debug!("{} -> {}", command.route(), status);
        Ok(RemoteResponse::new(status, body))
    }
}

/// Client talking to a live automation service over HTTP.
pub type HttpClient = RemoteCommandClient<HttpTransport>;

pub fn connect(server_url: &str) -> Result<HttpClient, RemoteError> {
    Ok(RemoteCommandClient::new(HttpTransport::new(server_url)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_encoded_as_single_segment() {
        let transport = HttpTransport::new("http://127.0.0.1:5000").unwrap();
        let command = RemoteCommand::get("get-image", "/api/images/get").with_segment("a/b c");
        let url = transport.url_for(&command).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:5000/api/images/get/a%2Fb%20c");
    }

    #[test]
    fn test_base_path_is_kept() {
        let transport = HttpTransport::new("http://localhost:8080/pilot/").unwrap();
        let url = transport
            .url_for(&RemoteCommand::get("list-programs", "/api/programs"))
            .unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/pilot/api/programs");
    }

    #[test]
    fn test_rejects_invalid_url() {
        assert!(HttpTransport::new("not a url").is_err());
        assert!(HttpTransport::new("mailto:someone@example.com").is_err());
    }
}
