use std::time::Duration;

use async_trait::async_trait;
use camp_core::{InstructionType, PageInspection, ReplyPayload, ResourceInspection};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

use super::{Executor, ExecutorError};

const NAVIGATE_ID: u64 = 3;

/// Loads a page in a browser reachable over the DevTools protocol and reports
/// every response the page received.
pub struct BrowserExecutor {
    http: reqwest::Client,
    endpoint: Url,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct DevtoolsTarget {
    id: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    ws_url: String,
}

impl BrowserExecutor {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self, ExecutorError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            endpoint,
            timeout,
        })
    }

    fn devtools_url(&self, path: &str) -> Result<Url, ExecutorError> {
        self.endpoint
            .join(path)
            .map_err(|err| ExecutorError::Failed(format!("invalid devtools endpoint: {err}")))
    }

    async fn open_target(&self) -> Result<DevtoolsTarget, ExecutorError> {
        let mut url = self.devtools_url("/json/new")?;
        url.set_query(Some("about:blank"));
        let target = self
            .http
            .put(url)
            .send()
            .await?
            .error_for_status()?
            .json::<DevtoolsTarget>()
            .await?;
        Ok(target)
    }

    async fn close_target(&self, id: &str) {
        let url = match self.devtools_url(&format!("/json/close/{id}")) {
            Ok(url) => url,
            Err(err) => {
                warn!(error = %err, "cannot build target close url");
                return;
            }
        };
        if let Err(err) = self.http.get(url).send().await {
            warn!(target_id = id, error = %err, "failed to close devtools target");
        }
    }
}

#[async_trait]
impl Executor for BrowserExecutor {
    fn kind(&self) -> InstructionType {
        InstructionType::BrowserInspect
    }

    async fn execute(&self, content: &str) -> Result<ReplyPayload, ExecutorError> {
        let page_url = content.trim();
        let parsed = Url::parse(page_url)
            .map_err(|err| ExecutorError::Failed(format!("invalid url {page_url:?}: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ExecutorError::Failed(format!(
                "unsupported scheme {}",
                parsed.scheme()
            )));
        }

        let target = self.open_target().await?;
        debug!(target_id = %target.id, page_url, "devtools target opened");
        let outcome = tokio::time::timeout(self.timeout, inspect(&target.ws_url, page_url)).await;
        self.close_target(&target.id).await;

        match outcome {
            Ok(result) => result.map(ReplyPayload::BrowserInspect),
            Err(_) => Err(ExecutorError::TimedOut(self.timeout)),
        }
    }
}

async fn inspect(ws_url: &str, page_url: &str) -> Result<PageInspection, ExecutorError> {
    let (mut ws, _) = connect_async(ws_url)
        .await
        .map_err(|err| ExecutorError::Failed(format!("devtools connect failed: {err}")))?;

    let commands = [
        json!({ "id": 1, "method": "Network.enable" }),
        json!({ "id": 2, "method": "Page.enable" }),
        json!({ "id": NAVIGATE_ID, "method": "Page.navigate", "params": { "url": page_url } }),
    ];
    for command in commands {
        ws.send(Message::Text(command.to_string()))
            .await
            .map_err(|err| ExecutorError::Failed(format!("devtools send failed: {err}")))?;
    }

    let mut recorder = PageRecorder::new(page_url);
    while let Some(message) = ws.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                return Err(ExecutorError::Failed(format!("devtools read failed: {err}")));
            }
        };
        let Ok(event) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        if recorder.observe(&event)? {
            let _ = ws.close(None).await;
            return Ok(recorder.finish());
        }
    }
    Err(ExecutorError::Failed(
        "devtools connection closed before the page loaded".to_string(),
    ))
}

/// Folds DevTools events into a [`PageInspection`].
///
/// The home page is the document response belonging to the navigation's own
/// loader, so redirects and canonicalised URLs still land there. Without a
/// loader match it falls back to the requested URL, then to the first
/// document seen.
struct PageRecorder {
    url: String,
    home: String,
    navigation: Option<String>,
    responses: Vec<Observed>,
}

struct Observed {
    loader_id: Option<String>,
    document: bool,
    entry: ResourceInspection,
}

impl PageRecorder {
    fn new(page_url: &str) -> Self {
        Self {
            url: page_url.to_string(),
            home: page_url.trim_end_matches('/').to_string(),
            navigation: None,
            responses: Vec::new(),
        }
    }

    /// Returns `Ok(true)` once the page's load event has fired.
    fn observe(&mut self, event: &Value) -> Result<bool, ExecutorError> {
        if event.get("id").and_then(Value::as_u64) == Some(NAVIGATE_ID) {
            if let Some(err) = event.pointer("/error/message").and_then(Value::as_str) {
                return Err(ExecutorError::Failed(format!("navigation failed: {err}")));
            }
            if let Some(err) = event
                .pointer("/result/errorText")
                .and_then(Value::as_str)
                .filter(|text| !text.is_empty())
            {
                return Err(ExecutorError::Failed(format!("navigation failed: {err}")));
            }
            self.navigation = event
                .pointer("/result/loaderId")
                .and_then(Value::as_str)
                .map(str::to_string);
            return Ok(false);
        }
        match event.get("method").and_then(Value::as_str) {
            Some("Network.responseReceived") => {
                if let Some(response) = event.pointer("/params/response") {
                    self.responses.push(Observed {
                        loader_id: event
                            .pointer("/params/loaderId")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        document: event.pointer("/params/type").and_then(Value::as_str)
                            == Some("Document"),
                        entry: resource_from_response(response),
                    });
                }
                Ok(false)
            }
            Some("Page.loadEventFired") => Ok(true),
            _ => Ok(false),
        }
    }

    fn home_index(&self) -> Option<usize> {
        let by_loader = self.navigation.as_deref().and_then(|loader| {
            self.responses
                .iter()
                .rposition(|seen| seen.document && seen.loader_id.as_deref() == Some(loader))
        });
        by_loader
            .or_else(|| {
                self.responses
                    .iter()
                    .position(|seen| seen.entry.url.trim_end_matches('/') == self.home)
            })
            .or_else(|| self.responses.iter().position(|seen| seen.document))
    }

    fn finish(self) -> PageInspection {
        let home = self.home_index();
        let mut inspection = PageInspection {
            url: self.url,
            ..Default::default()
        };
        for (index, seen) in self.responses.into_iter().enumerate() {
            if Some(index) == home {
                inspection.home_page = seen.entry;
            } else {
                inspection.resources.push(seen.entry);
            }
        }
        inspection
    }
}

fn resource_from_response(response: &Value) -> ResourceInspection {
    let text = |key: &str| {
        response
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let number = |key: &str| {
        response
            .get(key)
            .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
            .unwrap_or_default()
    };
    ResourceInspection {
        url: text("url"),
        remote_addr: text("remoteIPAddress"),
        remote_port: number("remotePort"),
        status: number("status"),
        protocol: text("protocol"),
        timing: response.get("timing").cloned(),
        from_disk_cache: response
            .get("fromDiskCache")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        security_state: text("securityState"),
        security_details: response.get("securityDetails").cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_event(url: &str, status: u16) -> Value {
        json!({
            "method": "Network.responseReceived",
            "params": {
                "response": {
                    "url": url,
                    "status": status,
                    "remoteIPAddress": "93.184.216.34",
                    "remotePort": 443,
                    "protocol": "h2",
                    "fromDiskCache": false,
                    "securityState": "secure",
                    "timing": { "requestTime": 1.5 }
                }
            }
        })
    }

    #[test_timeout::timeout]
    fn splits_document_from_resources() {
        let mut recorder = PageRecorder::new("https://example.com");
        assert!(!recorder.observe(&json!({ "id": 3, "result": { "frameId": "F" } })).unwrap());
        assert!(!recorder.observe(&response_event("https://example.com/", 200)).unwrap());
        assert!(!recorder
            .observe(&response_event("https://example.com/app.js", 304))
            .unwrap());
        assert!(recorder.observe(&json!({ "method": "Page.loadEventFired" })).unwrap());

        let page = recorder.finish();
        assert_eq!(page.url, "https://example.com");
        assert_eq!(page.home_page.status, 200);
        assert_eq!(page.home_page.remote_addr, "93.184.216.34");
        assert_eq!(page.home_page.protocol, "h2");
        assert_eq!(page.resources.len(), 1);
        assert_eq!(page.resources[0].url, "https://example.com/app.js");
    }

    fn typed_response(url: &str, status: u16, kind: &str, loader: &str) -> Value {
        let mut event = response_event(url, status);
        event["params"]["type"] = json!(kind);
        event["params"]["loaderId"] = json!(loader);
        event
    }

    #[test_timeout::timeout]
    fn redirected_document_is_the_home_page() {
        let mut recorder = PageRecorder::new("http://example.com");
        recorder
            .observe(&json!({ "id": 3, "result": { "frameId": "F", "loaderId": "L1" } }))
            .unwrap();
        for event in [
            typed_response("https://www.example.com/en/", 200, "Document", "L1"),
            typed_response("https://www.example.com/app.js", 200, "Script", "L1"),
            typed_response("https://ads.example.net/frame", 200, "Document", "L2"),
        ] {
            assert!(!recorder.observe(&event).unwrap());
        }
        assert!(recorder.observe(&json!({ "method": "Page.loadEventFired" })).unwrap());

        let page = recorder.finish();
        assert_eq!(page.url, "http://example.com");
        assert_eq!(page.home_page.url, "https://www.example.com/en/");
        assert_eq!(page.home_page.status, 200);
        let resources: Vec<_> = page.resources.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(
            resources,
            ["https://www.example.com/app.js", "https://ads.example.net/frame"]
        );
    }

    #[test_timeout::timeout]
    fn first_document_is_used_when_nothing_else_matches() {
        let mut recorder = PageRecorder::new("http://example.com");
        recorder
            .observe(&typed_response("https://cdn.example.com/lib.js", 200, "Script", "L9"))
            .unwrap();
        recorder
            .observe(&typed_response("https://example.org/", 301, "Document", "L9"))
            .unwrap();

        let page = recorder.finish();
        assert_eq!(page.home_page.url, "https://example.org/");
        assert_eq!(page.resources.len(), 1);
    }

    #[test_timeout::timeout]
    fn navigation_error_fails_the_inspection() {
        let mut recorder = PageRecorder::new("https://nowhere.invalid");
        let err = recorder
            .observe(&json!({ "id": 3, "result": { "errorText": "net::ERR_NAME_NOT_RESOLVED" } }))
            .unwrap_err();
        assert!(err.to_string().contains("ERR_NAME_NOT_RESOLVED"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn rejects_non_http_urls_without_touching_the_browser() {
        let executor = BrowserExecutor::new(
            Url::parse("http://127.0.0.1:9").unwrap(),
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(executor.execute("file:///etc/passwd").await.is_err());
    }
}
