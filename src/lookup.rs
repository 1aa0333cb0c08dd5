//! Client side of the trailer lookup: item id → [`TrailerDescriptor`].

use anyhow::{Context, Result};
use std::{future::Future, time::Duration};

use crate::descriptor::TrailerDescriptor;

/// Narrow request/response contract the preview engine resolves trailers
/// through. A miss is a typed unavailable descriptor; `Err` means the attempt
/// failed and may be retried by a later hover.
pub trait TrailerLookup: Send + Sync + 'static {
    fn lookup(&self, item_id: &str) -> impl Future<Output = Result<TrailerDescriptor>> + Send;
}

/// Talks to `GET {base}/TrailerPreview/TrailerInfo/{itemId}`.
pub struct HttpTrailerLookup {
    client: reqwest::Client,
    base: String,
}

impl HttpTrailerLookup {
    pub fn new(base: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building lookup http client")?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self, item_id: &str) -> String {
        format!("{}/TrailerPreview/TrailerInfo/{item_id}", self.base)
    }
}

impl TrailerLookup for HttpTrailerLookup {
    async fn lookup(&self, item_id: &str) -> Result<TrailerDescriptor> {
        let resp = self
            .client
            .get(self.endpoint(item_id))
            .send()
            .await
            .context("requesting trailer info")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(TrailerDescriptor::unavailable(item_id));
        }
        let descriptor = resp
            .error_for_status()
            .context("trailer info status")?
            .json::<TrailerDescriptor>()
            .await
            .context("decoding trailer info")?;
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_joins_base() {
        let l = HttpTrailerLookup::new("http://host:8097/", Duration::from_secs(1)).expect("client");
        assert_eq!(
            l.endpoint("abc"),
            "http://host:8097/TrailerPreview/TrailerInfo/abc"
        );
    }
}
