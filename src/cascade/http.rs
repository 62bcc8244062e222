use super::ReadingFetcher;
use crate::endpoint::SourceEndpoint;
use crate::error::EndpointError;
use crate::payload::decode_reading;
use crate::reading::RawReading;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

/// Fetches `GET http://{host}:{port}/json` and decodes the PurpleAir schema.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("purple-aqi/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReadingFetcher for HttpFetcher {
    async fn fetch(
        &self,
        endpoint: &SourceEndpoint,
        deadline: Duration,
    ) -> Result<RawReading, EndpointError> {
        let url = endpoint.url();
        tracing::trace!(%url, deadline_ms = deadline.as_millis() as u64, "fetching reading");

        let response = self
            .client
            .get(&url)
            .timeout(deadline)
            .send()
            .await
            .map_err(|err| classify(err, deadline))?
            .error_for_status()
            .map_err(|err| classify(err, deadline))?;
        let body = response
            .bytes()
            .await
            .map_err(|err| classify(err, deadline))?;

        let mut body = body.to_vec();
        Ok(decode_reading(endpoint.id(), &mut body)?)
    }
}

fn classify(err: reqwest::Error, deadline: Duration) -> EndpointError {
    if err.is_timeout() {
        EndpointError::Timeout { after: deadline }
    } else {
        EndpointError::from(err)
    }
}
