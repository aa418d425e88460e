//! Transport adapters: blocking HTTP form posts to the ledger endpoint, and a
//! scripted in-process transport that records requests and replays canned
//! responses.
#![deny(missing_docs)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use parking_lot::Mutex;
use tracing::{debug, warn};

/// Transport error.
pub type TransportResult<T> = Result<T, anyhow::Error>;

/// Form fields of one request.
pub type Form = BTreeMap<String, String>;

/// Single synchronous request/response exchange with the ledger.
pub trait Transport: Send + Sync {
    /// Send `form` to `url` and return the raw response body.
    fn exchange(&self, url: &str, form: &Form) -> TransportResult<Vec<u8>>;
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn exchange(&self, url: &str, form: &Form) -> TransportResult<Vec<u8>> {
        (**self).exchange(url, form)
    }
}

const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Form-encoded HTTP POST over a blocking reqwest client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    /// Client with the default request timeout.
    pub fn new() -> TransportResult<Self> {
        Self::with_timeout(DEFAULT_HTTP_TIMEOUT)
    }

    /// Client with a custom request timeout.
    pub fn with_timeout(timeout: Duration) -> TransportResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn exchange(&self, url: &str, form: &Form) -> TransportResult<Vec<u8>> {
        let response = self
            .client
            .post(url)
            .form(form)
            .send()
            .map_err(|err| request_error(err, url))?;
        let status = response.status();
        if !status.is_success() {
            warn!(%url, %status, "ledger endpoint returned an error status");
            return Err(anyhow!("request to {url} failed with status {status}"));
        }
        let body = response
            .bytes()
            .with_context(|| format!("reading response body from {url}"))?;
        debug!(%url, bytes = body.len(), "ledger exchange completed");
        Ok(body.to_vec())
    }
}

fn request_error(error: reqwest::Error, url: &str) -> anyhow::Error {
    if error.is_timeout() {
        anyhow!("request to {url} timed out")
    } else {
        anyhow!("request to {url} failed: {error}")
    }
}

/// Request captured by [`ScriptedTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    /// Target URL.
    pub url: String,
    /// Form fields.
    pub form: Form,
}

type Responder = Box<dyn Fn(&RecordedRequest) -> TransportResult<Vec<u8>> + Send + Sync>;

/// In-process transport for tests and offline tooling.
///
/// Queued responses are served first, in order; once the queue is empty the
/// fallback responder (if any) answers, otherwise the exchange fails.
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<TransportResult<Vec<u8>>>>,
    fallback: Option<Responder>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedTransport {
    /// Transport with nothing scripted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport answering every unscripted request with `responder`.
    pub fn with_fallback<F>(responder: F) -> Self
    where
        F: Fn(&RecordedRequest) -> TransportResult<Vec<u8>> + Send + Sync + 'static,
    {
        Self {
            fallback: Some(Box::new(responder)),
            ..Self::default()
        }
    }

    /// Queue a successful response body.
    pub fn push_response(&self, body: impl Into<Vec<u8>>) {
        self.responses.lock().push_back(Ok(body.into()));
    }

    /// Queue a transport failure.
    pub fn push_failure(&self, message: &str) {
        self.responses.lock().push_back(Err(anyhow!(message.to_string())));
    }

    /// Every request seen so far, in order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests seen so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Number of scripted responses not yet served.
    pub fn pending_responses(&self) -> usize {
        self.responses.lock().len()
    }
}

impl std::fmt::Debug for ScriptedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedTransport")
            .field("pending_responses", &self.pending_responses())
            .field("requests", &self.request_count())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl Transport for ScriptedTransport {
    fn exchange(&self, url: &str, form: &Form) -> TransportResult<Vec<u8>> {
        let request = RecordedRequest {
            url: url.to_string(),
            form: form.clone(),
        };
        self.requests.lock().push(request.clone());
        if let Some(scripted) = self.responses.lock().pop_front() {
            return scripted;
        }
        match &self.fallback {
            Some(responder) => responder(&request),
            None => Err(anyhow!("no scripted response left for {url}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(pairs: &[(&str, &str)]) -> Form {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn scripted_responses_are_served_in_order() {
        let transport = ScriptedTransport::new();
        transport.push_response("first");
        transport.push_failure("boom");
        let f = form(&[("version", "1_0")]);
        assert_eq!(transport.exchange("http://x", &f).unwrap(), b"first");
        let err = transport.exchange("http://x", &f).unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert!(transport.exchange("http://x", &f).is_err());
        assert_eq!(transport.request_count(), 3);
        assert_eq!(transport.requests()[0].form["version"], "1_0");
    }

    #[test]
    fn fallback_answers_after_script_runs_out() {
        let transport = ScriptedTransport::with_fallback(|req| {
            Ok(format!("echo {}", req.form.len()).into_bytes())
        });
        transport.push_response("scripted");
        let f = form(&[("a", "1"), ("b", "2")]);
        assert_eq!(transport.exchange("u", &f).unwrap(), b"scripted");
        assert_eq!(transport.exchange("u", &f).unwrap(), b"echo 2");
    }

    #[test]
    fn shared_transport_records_through_arc() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_response("ok");
        let shared: Arc<dyn Transport> = transport.clone();
        shared.exchange("u", &Form::new()).unwrap();
        assert_eq!(transport.request_count(), 1);
    }

    #[test]
    fn http_transport_builds() {
        assert!(HttpTransport::with_timeout(Duration::from_secs(1)).is_ok());
    }
}
