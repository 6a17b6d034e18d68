//! Outbound requests: URL shaping, optional relay indirection, and the
//! retry/backoff loop every logical query goes through.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode, Url};
use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::notify::{notify_within, Notifier, Urgency};
use crate::{Error, Result};

pub const BASE_URL: &str = "https://www.webnovel.com/go/pcm";
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:120.0)";
/// Query parameter carrying the real target when going through a relay.
pub const RELAY_PARAM: &str = "url";

/// Sends a single GET and hands back the body of a successful response.
///
/// Implementations report a 429 as [`Error::RateLimited`], any other
/// unsuccessful status as [`Error::HttpStatus`] and connection problems as
/// [`Error::Transport`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &Url) -> Result<String>;
}

/// `reqwest` backed transport. Every request carries the browser user agent.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// `timeout` bounds the whole exchange, from connecting to reading the body.
    pub fn new(timeout: Duration) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::USER_AGENT, header::HeaderValue::from_static(USER_AGENT));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| Error::Transport(err.to_string()))?;
        Ok(Self { client })
    }

    /// Client used for other outbound calls, such as webhook notifications.
    pub fn client(&self) -> Client {
        // Client uses Arc so we can clone cheaply
        self.client.clone()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &Url) -> Result<String> {
        let res = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(transport_error)?;

        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RateLimited);
        }
        if !(status.is_success() || status.is_redirection()) {
            return Err(Error::HttpStatus(status));
        }
        res.text().await.map_err(transport_error)
    }
}

fn transport_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Transport(format!("timed out: {err}"))
    } else {
        Error::Transport(err.to_string())
    }
}

/// Waiting between attempts, injectable so backoff can be observed in tests.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Result of one HTTP attempt, as seen by the retry loop.
#[derive(Debug)]
pub enum Attempt {
    Success(String),
    RateLimited,
    Failed(Error),
}

impl From<Result<String>> for Attempt {
    fn from(value: Result<String>) -> Self {
        match value {
            Ok(body) => Attempt::Success(body),
            Err(Error::RateLimited) => Attempt::RateLimited,
            Err(err) => Attempt::Failed(err),
        }
    }
}

/// Builds `{base}{path}?{params}`, wrapped into the relay's `url` parameter
/// when a relay is given.
pub fn build_url(
    base: &str,
    path: &str,
    params: &[(&str, String)],
    relay: Option<&str>,
) -> Result<Url> {
    let target = format!("{base}{path}");
    let url = Url::parse_with_params(&target, params).map_err(|err| Error::InvalidUrl {
        url: target.clone(),
        reason: err.to_string(),
    })?;

    match relay {
        None => Ok(url),
        Some(relay) => Url::parse_with_params(relay, [(RELAY_PARAM, url.as_str())]).map_err(
            |err| Error::InvalidUrl {
                url: relay.to_string(),
                reason: err.to_string(),
            },
        ),
    }
}

/// Retry-capable request primitive shared by all logical queries.
#[derive(Clone)]
pub struct Requester {
    transport: Arc<dyn Transport>,
    sleeper: Arc<dyn Sleeper>,
    notifier: Arc<dyn Notifier>,
    policy: RetryPolicy,
    base_url: String,
    relay_url: Option<String>,
}

impl Requester {
    pub fn new(
        transport: Arc<dyn Transport>,
        sleeper: Arc<dyn Sleeper>,
        notifier: Arc<dyn Notifier>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            sleeper,
            notifier,
            policy,
            base_url: BASE_URL.to_string(),
            relay_url: None,
        }
    }

    pub fn with_relay(mut self, relay_url: Option<String>) -> Self {
        self.relay_url = relay_url;
        self
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn url(&self, path: &str, params: &[(&str, String)]) -> Result<Url> {
        build_url(&self.base_url, path, params, self.relay_url.as_deref())
    }

    /// Hands a message to the sink, giving up after `notify_timeout` so a
    /// stuck sink never holds up the request that reported it.
    pub async fn notify(&self, message: &str, description: Option<&str>, urgency: Urgency) {
        notify_within(
            self.notifier.as_ref(),
            self.policy.notify_timeout,
            message,
            description,
            urgency,
        )
        .await;
    }

    /// Issues `GET path?params` until it succeeds or the attempt budget runs out.
    ///
    /// A 429 waits out the fixed cooldown and tries again without using up an
    /// attempt. Any other failure after attempt `n` waits `2^n` backoff units;
    /// the last failure surfaces as [`Error::RequestExhausted`] and is broadcast
    /// as urgent.
    pub async fn get(&self, operation: &str, path: &str, params: &[(&str, String)]) -> Result<String> {
        self.get_with(operation, path, params, Urgency::Urgent).await
    }

    /// Same as [`Requester::get`], but exhaustion is reported at normal
    /// urgency. Meant for lookups whose failure the caller tolerates.
    pub async fn get_best_effort(
        &self,
        operation: &str,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<String> {
        self.get_with(operation, path, params, Urgency::Normal).await
    }

    async fn get_with(
        &self,
        operation: &str,
        path: &str,
        params: &[(&str, String)],
        exhausted: Urgency,
    ) -> Result<String> {
        let url = self.url(path, params)?;
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            debug!(operation, attempt, %url, "sending request");
            match Attempt::from(self.transport.get(&url).await) {
                Attempt::Success(body) => return Ok(body),
                Attempt::RateLimited => {
                    let cooldown = self.policy.rate_limit_cooldown;
                    warn!(operation, cooldown_secs = cooldown.as_secs(), "rate limited");
                    self.notify(
                        "Rate limited",
                        Some(&format!(
                            "{operation}: waiting {} seconds before retrying",
                            cooldown.as_secs()
                        )),
                        Urgency::Normal,
                    )
                    .await;
                    self.sleeper.sleep(cooldown).await;
                }
                Attempt::Failed(err) if attempt < max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_secs = delay.as_secs(),
                        error = %err,
                        "request failed, retrying"
                    );
                    self.notify(
                        &format!(
                            "Request failed (attempt {attempt}/{max_attempts}), retrying in {} seconds",
                            delay.as_secs()
                        ),
                        Some(&format!("{operation}: {err}")),
                        Urgency::Normal,
                    )
                    .await;
                    self.sleeper.sleep(delay).await;
                    attempt += 1;
                }
                Attempt::Failed(err) => {
                    warn!(operation, attempts = attempt, error = %err, "giving up on request");
                    self.notify(
                        &format!("Request exhausted after {attempt} attempts"),
                        Some(&format!("{operation}: {err}")),
                        exhausted,
                    )
                    .await;
                    return Err(Error::RequestExhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    /// Replays canned responses in order and records every requested URL.
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        pub responses: Mutex<VecDeque<Result<String>>>,
        pub requested: Mutex<Vec<Url>>,
    }

    impl ScriptedTransport {
        pub fn new(responses: Vec<Result<String>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requested: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn get(&self, url: &Url) -> Result<String> {
            self.requested.lock().unwrap().push(url.clone());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::Transport("script ran out".into())))
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingSleeper {
        pub slept: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub sent: Mutex<Vec<(String, Urgency)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, message: &str, _description: Option<&str>, urgency: Urgency) {
            self.sent.lock().unwrap().push((message.to_string(), urgency));
        }
    }

    fn requester(
        transport: Arc<ScriptedTransport>,
        sleeper: Arc<RecordingSleeper>,
        notifier: Arc<RecordingNotifier>,
    ) -> Requester {
        Requester::new(transport, sleeper, notifier, RetryPolicy::default())
    }

    #[test]
    fn url_without_relay_encodes_params() {
        let url = build_url(
            BASE_URL,
            "/comic/getContent",
            &[("comicId", "100".into()), ("chapterId", "3".into())],
            None,
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://www.webnovel.com/go/pcm/comic/getContent?comicId=100&chapterId=3"
        );
    }

    #[test]
    fn relay_wraps_the_whole_target() {
        let url = build_url(
            BASE_URL,
            "/comic/getChapterList",
            &[("comicId", "7".into())],
            Some("https://relay.example/fetch"),
        )
        .unwrap();
        assert_eq!(url.host_str(), Some("relay.example"));
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![(
                RELAY_PARAM.to_string(),
                "https://www.webnovel.com/go/pcm/comic/getChapterList?comicId=7".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn success_needs_no_sleep() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok("{}".into())]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let req = requester(transport.clone(), sleeper.clone(), notifier.clone());

        let body = req.get("lookup", "/x", &[]).await.unwrap();

        assert_eq!(body, "{}");
        assert!(sleeper.slept.lock().unwrap().is_empty());
        assert!(notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn backoff_grows_until_exhausted() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(Error::HttpStatus(StatusCode::BAD_GATEWAY)),
            Err(Error::Transport("reset".into())),
            Err(Error::HttpStatus(StatusCode::INTERNAL_SERVER_ERROR)),
        ]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let req = requester(transport.clone(), sleeper.clone(), notifier.clone());

        let err = req.get("lookup", "/x", &[]).await.unwrap_err();

        assert!(matches!(err, Error::RequestExhausted { attempts: 3, .. }));
        assert_eq!(transport.requested.lock().unwrap().len(), 3);
        assert_eq!(
            *sleeper.slept.lock().unwrap(),
            vec![Duration::from_secs(2), Duration::from_secs(4)]
        );
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].1, Urgency::Normal);
        assert_eq!(sent[1].1, Urgency::Normal);
        assert_eq!(sent[2].1, Urgency::Urgent);
    }

    #[tokio::test]
    async fn rate_limit_cools_down_without_spending_attempts() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(Error::HttpStatus(StatusCode::SERVICE_UNAVAILABLE)),
            Err(Error::RateLimited),
            Err(Error::RateLimited),
            Err(Error::HttpStatus(StatusCode::SERVICE_UNAVAILABLE)),
            Ok("done".into()),
        ]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let req = requester(transport.clone(), sleeper.clone(), notifier.clone());

        let body = req.get("lookup", "/x", &[]).await.unwrap();

        assert_eq!(body, "done");
        assert_eq!(
            *sleeper.slept.lock().unwrap(),
            vec![
                Duration::from_secs(2),
                Duration::from_secs(60),
                Duration::from_secs(60),
                Duration::from_secs(4),
            ]
        );
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent[1].0, "Rate limited");
        assert_eq!(sent[2].0, "Rate limited");
    }

    #[tokio::test]
    async fn single_attempt_budget_fails_fast() {
        let transport = Arc::new(ScriptedTransport::new(vec![Err(Error::Transport(
            "refused".into(),
        ))]));
        let sleeper = Arc::new(RecordingSleeper::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let req = Requester::new(
            transport,
            sleeper.clone(),
            notifier,
            RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            },
        );

        let err = req.get("lookup", "/x", &[]).await.unwrap_err();

        assert!(matches!(err, Error::RequestExhausted { attempts: 1, .. }));
        assert!(sleeper.slept.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn best_effort_exhaustion_is_not_broadcast() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(Error::Transport("reset".into())),
            Err(Error::Transport("reset".into())),
            Err(Error::Transport("reset".into())),
        ]));
        let notifier = Arc::new(RecordingNotifier::default());
        let req = requester(
            transport,
            Arc::new(RecordingSleeper::default()),
            notifier.clone(),
        );

        let err = req.get_best_effort("lookup", "/x", &[]).await.unwrap_err();

        assert!(matches!(err, Error::RequestExhausted { attempts: 3, .. }));
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|(_, urgency)| *urgency == Urgency::Normal));
    }

    /// Accepts every notification and never finishes delivering it.
    struct StuckNotifier;

    #[async_trait]
    impl Notifier for StuckNotifier {
        async fn notify(&self, _message: &str, _description: Option<&str>, _urgency: Urgency) {
            std::future::pending::<()>().await;
        }
    }

    #[tokio::test]
    async fn stuck_sink_does_not_hold_up_retries() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(Error::HttpStatus(StatusCode::BAD_GATEWAY)),
            Ok("done".into()),
        ]));
        let req = Requester::new(
            transport,
            Arc::new(RecordingSleeper::default()),
            Arc::new(StuckNotifier),
            RetryPolicy {
                notify_timeout: Duration::from_millis(50),
                ..RetryPolicy::default()
            },
        );

        let body = tokio::time::timeout(Duration::from_secs(2), req.get("lookup", "/x", &[]))
            .await
            .expect("request should not wait on the sink")
            .unwrap();

        assert_eq!(body, "done");
    }

    #[tokio::test]
    async fn unanswered_request_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Hold the connection open without ever answering.
            let (_socket, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
        });
        let transport = HttpTransport::new(Duration::from_millis(200)).unwrap();
        let url = Url::parse(&format!("http://{addr}/comic/getChapterList")).unwrap();

        let res = tokio::time::timeout(Duration::from_secs(5), transport.get(&url))
            .await
            .expect("transport should give up on its own");

        match res {
            Err(Error::Transport(reason)) => assert!(reason.starts_with("timed out")),
            other => panic!("expected a transport timeout, got {other:?}"),
        }
    }
}
