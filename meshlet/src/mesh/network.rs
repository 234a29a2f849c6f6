//! Real-network dispatcher: drives the streaming callback contract over a
//! reqwest client. Terminal stage of the pipeline for every request the
//! interceptor classifies as external.

use std::sync::Arc;

use async_trait::async_trait;

use crate::mesh::dispatch::{
    DispatchError, DispatchHandler, DispatchRequest, Dispatcher, SequencedHandler,
};

pub struct NetworkDispatcher {
    client: reqwest::Client,
}

impl NetworkDispatcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Default for NetworkDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dispatcher for NetworkDispatcher {
    async fn dispatch(&self, mut request: DispatchRequest, handler: Box<dyn DispatchHandler>) {
        let mut handler = SequencedHandler::new(handler);

        let url = match request.target_url() {
            Ok(url) => url,
            Err(e) => {
                handler.error(e);
                return;
            }
        };
        let method = match reqwest::Method::from_bytes(request.method.as_bytes()) {
            Ok(method) => method,
            Err(e) => {
                handler.error(DispatchError::Network(format!(
                    "invalid method '{}': {}",
                    request.method, e
                )));
                return;
            }
        };

        let mut builder = self.client.request(method, url);
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = request.body.take() {
            builder = builder.body(body);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                handler.error(DispatchError::Network(e.to_string()));
                return;
            }
        };

        let status = response.status();
        let headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .map(|(key, value)| {
                (
                    key.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        handler.headers(
            status.as_u16(),
            &headers,
            status.canonical_reason().unwrap_or(""),
        );

        match response.bytes().await {
            Ok(bytes) => {
                handler.data(bytes);
                handler.complete(&[]);
            }
            Err(e) => handler.error(DispatchError::Network(e.to_string())),
        }
    }
}
