//! reqwest-backed transport

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{Result, Transport, TransportError, TransportResponse};
use crate::engine::retry::FailureKind;
use crate::engine::target::Target;

const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:146.0) Gecko/20100101 Firefox/146.0";

/// Header profile applied to every request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProfile {
    /// Plain client with the configured user agent
    #[default]
    Standard,
    /// Browser-like headers for archives that challenge automated clients
    Browser,
}

/// HTTP transport. Holds one verifying and one non-verifying client so the
/// per-target TLS flag does not require rebuilding clients.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    verified: Client,
    unverified: Client,
    profile: TransportProfile,
}

impl HttpTransport {
    pub fn new(user_agent: &str, profile: TransportProfile) -> Result<Self> {
        let user_agent = match profile {
            TransportProfile::Standard => user_agent,
            TransportProfile::Browser => BROWSER_USER_AGENT,
        };

        let build = |verify: bool| {
            Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .user_agent(user_agent)
                .redirect(reqwest::redirect::Policy::limited(10))
                .danger_accept_invalid_certs(!verify)
                .build()
                .map_err(|e| TransportError::new(FailureKind::FatalClient, e.to_string()))
        };

        Ok(Self {
            verified: build(true)?,
            unverified: build(false)?,
            profile,
        })
    }

    fn client(&self, verify_tls: bool) -> &Client {
        if verify_tls {
            &self.verified
        } else {
            &self.unverified
        }
    }
}

/// Map a reqwest failure onto the retry taxonomy
fn classify(err: &reqwest::Error) -> FailureKind {
    if err.is_builder() {
        FailureKind::FatalClient
    } else if let Some(status) = err.status() {
        FailureKind::from_status(status.as_u16())
    } else {
        // timeouts, connect/TLS failures, resets, truncated bodies
        FailureKind::TransientNetwork
    }
}

fn to_transport_error(err: reqwest::Error) -> TransportError {
    TransportError::new(classify(&err), err.to_string())
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, target: &Target) -> Result<TransportResponse> {
        let options = target.options();
        debug!(key = %target.key(), url = target.url(), "Sending request");

        let mut request = self.client(options.verify_tls).get(target.url());

        // a streamed body may legitimately outlast the timeout; the caller
        // bounds the response head and each body read instead
        if !options.stream {
            request = request.timeout(options.timeout);
        }

        if !target.query().is_empty() {
            request = request.query(target.query());
        }

        if self.profile == TransportProfile::Browser {
            request = request
                .header(reqwest::header::ACCEPT, "*/*")
                .header(reqwest::header::ACCEPT_LANGUAGE, "en-US,en;q=0.5");
        }

        for (name, value) in &options.headers {
            request = request.header(name, value);
        }

        if let Some((user, password)) = &options.basic_auth {
            request = request.basic_auth(user, password.as_ref());
        }

        let response = request.send().await.map_err(to_transport_error)?;
        let status = response.status().as_u16();

        debug!(key = %target.key(), status, "Response received");

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(to_transport_error))
            .boxed();

        Ok(TransportResponse::new(status, body))
    }
}
