// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! HTTP transport for the key backup service.

use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, COOKIE};
use reqwest::Client;
use url::Url;

use super::{HttpMethod, Transport, TransportError, TransportRequest, TransportResponse};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: Url,
    http: Client,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self, TransportError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| TransportError::Request(format!("invalid base URL {base_url}: {e}")))?;
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { base_url, http })
    }

    fn url(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| TransportError::Request(format!("invalid request path {path}: {e}")))
    }
}

impl Transport for HttpTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let url = self.url(&request.path)?;
        let mut builder = match request.method {
            HttpMethod::Get => self.http.get(url),
            HttpMethod::Put => self.http.put(url),
        }
        .basic_auth(&request.auth.username, Some(&request.auth.password));

        if !request.cookies.is_empty() {
            builder = builder.header(COOKIE, request.cookies.join("; "));
        }
        if let Some(body) = request.body {
            builder = builder.header(CONTENT_TYPE, "application/json").body(body);
        }

        let response = builder.send().await.map_err(|e| {
            TransportError::Request(format!("{:?} {} failed: {e}", request.method, request.path))
        })?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| {
            TransportError::InvalidResponse(format!("failed to read response body: {e}"))
        })?;

        Ok(TransportResponse {
            status,
            body: body.to_vec(),
        })
    }
}
