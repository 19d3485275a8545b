use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder, Response};
use tracing::info;
use url::Url;

use crate::browser::{RetryOutcome, RetryPolicy, ScrapeError, ScrapeResult};

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub fn http_client() -> ScrapeResult<Client> {
    Ok(Client::builder().timeout(REQUEST_TIMEOUT).build()?)
}

/// Sends the request and fails with `NetworkNotOk` on any non-2xx status.
pub async fn request_ok(request: RequestBuilder) -> ScrapeResult<Response> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(ScrapeError::NetworkNotOk {
            url: response.url().to_string(),
            status: status.as_u16(),
        });
    }
    Ok(response)
}

/// `{gateway}/metrics/job/{job}`, keeping any path prefix on the gateway.
pub fn push_url(gateway: &Url, job: &str) -> ScrapeResult<Url> {
    let mut url = gateway.clone();
    url.path_segments_mut()
        .map_err(|_| ScrapeError::Configuration(format!("{gateway} cannot carry a path")))?
        .pop_if_empty()
        .extend(["metrics", "job", job]);
    Ok(url)
}

/// PUTs an exposition body to a push gateway, retrying per `policy`.
pub async fn push_metrics(
    client: &Client,
    gateway: &Url,
    job: &str,
    body: &str,
    policy: &RetryPolicy,
) -> ScrapeResult<RetryOutcome<()>> {
    let url = push_url(gateway, job)?;
    let outcome = policy
        .run("push metrics", |_| {
            let request = client
                .put(url.clone())
                .header(CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)
                .body(body.to_string());
            async move { request_ok(request).await.map(|_| ()) }
        })
        .await?;
    info!(url = %url, attempts = outcome.attempts, "pushed metrics");
    Ok(outcome)
}
