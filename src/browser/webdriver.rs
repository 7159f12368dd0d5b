use crate::browser::{Browser, BrowserError, Page, StorageState};
use crate::config::WorkerConfig;
use crate::http::build_driver_client;
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use reqwest::{Client, Method};
use serde_json::{Value, json};
use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

const ELEMENT_KEY: &str = "element-6066-11e4-a23c-4a2a4c4fb3ec";
const POLL_INTERVAL: Duration = Duration::from_millis(250);
const IDLE_QUIET_PERIOD: Duration = Duration::from_millis(500);

const TEXTS_SCRIPT: &str = "return Array.from(document.querySelectorAll(arguments[0]))\
    .map(e => (e.innerText || e.value || e.textContent || '').trim());";
const RESOURCE_COUNT_SCRIPT: &str = "return document.readyState === 'complete' \
    ? performance.getEntriesByType('resource').length : -1;";
const DUMP_STORAGE_SCRIPT: &str =
    "return [location.origin, JSON.stringify(Object.assign({}, window.localStorage))];";
const RESTORE_STORAGE_SCRIPT: &str =
    "for (const [k, v] of Object.entries(arguments[0])) { window.localStorage.setItem(k, v); }";

type SessionRegistry = Arc<Mutex<HashSet<String>>>;

/// W3C WebDriver endpoint (chromedriver). Every context is a driver session;
/// the registry lets `close` tear all of them down on shutdown.
pub struct WebDriverBrowser {
    endpoint: String,
    http: Client,
    headless: bool,
    action_timeout: Duration,
    navigation_timeout: Duration,
    sessions: SessionRegistry,
}

impl WebDriverBrowser {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            endpoint: config.webdriver_url.trim_end_matches('/').to_string(),
            http: build_driver_client(config.navigation_timeout),
            headless: config.headless,
            action_timeout: config.action_timeout,
            navigation_timeout: config.navigation_timeout,
            sessions: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn capabilities(&self) -> Value {
        let mut args = vec![
            "--disable-blink-features=AutomationControlled",
            "--window-size=1366,900",
            "--lang=ja-JP",
        ];
        if self.headless {
            args.push("--headless=new");
        }
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "pageLoadStrategy": "normal",
                    "timeouts": {
                        "implicit": 0,
                        "pageLoad": self.navigation_timeout.as_millis() as u64,
                        "script": self.action_timeout.as_millis() as u64,
                    },
                    "goog:chromeOptions": { "args": args },
                }
            }
        })
    }
}

#[async_trait]
impl Browser for WebDriverBrowser {
    async fn new_context(&self) -> Result<Box<dyn Page>, BrowserError> {
        let url = format!("{}/session", self.endpoint);
        let value = command(&self.http, Method::POST, &url, Some(self.capabilities())).await?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| BrowserError::Protocol("new session response without sessionId".into()))?
            .to_string();
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.clone());
        debug!(target = "dropship.browser", session_id = %session_id, "context_opened");
        Ok(Box::new(WebDriverPage {
            http: self.http.clone(),
            base: format!("{}/session/{}", self.endpoint, session_id),
            session_id,
            action_timeout: self.action_timeout,
            navigation_timeout: self.navigation_timeout,
            sessions: self.sessions.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), BrowserError> {
        let ids: Vec<String> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        info!(target = "dropship.browser", contexts = ids.len(), "browser_shutdown");
        for id in ids {
            let url = format!("{}/session/{}", self.endpoint, id);
            if let Err(err) = command(&self.http, Method::DELETE, &url, None).await {
                warn!(target = "dropship.browser", session_id = %id, error = %err, "context_close_failed");
            }
        }
        Ok(())
    }
}

pub struct WebDriverPage {
    http: Client,
    base: String,
    session_id: String,
    action_timeout: Duration,
    navigation_timeout: Duration,
    sessions: SessionRegistry,
    closed: AtomicBool,
}

impl WebDriverPage {
    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, BrowserError> {
        let url = format!("{}{}", self.base, path);
        command(&self.http, method, &url, body).await
    }

    async fn execute(&self, script: &str, args: Value) -> Result<Value, BrowserError> {
        self.call(
            Method::POST,
            "/execute/sync",
            Some(json!({ "script": script, "args": args })),
        )
        .await
    }

    async fn find_elements(&self, selector: &str) -> Result<Vec<String>, BrowserError> {
        let value = self
            .call(
                Method::POST,
                "/elements",
                Some(json!({ "using": "css selector", "value": selector })),
            )
            .await?;
        Ok(value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get(ELEMENT_KEY).and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn wait_for_element(&self, selector: &str, index: usize) -> Result<String, BrowserError> {
        let deadline = Instant::now() + self.action_timeout;
        loop {
            let mut found = self.find_elements(selector).await?;
            if found.len() > index {
                return Ok(found.swap_remove(index));
            }
            if Instant::now() >= deadline {
                return Err(BrowserError::Timeout(selector.to_string()));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    // Idle once the resource count holds still for the quiet period. Pages
    // with endless beacons hit the ceiling; the document itself is loaded by
    // then, so that only gets logged.
    async fn wait_for_network_idle(&self) -> Result<(), BrowserError> {
        let deadline = Instant::now() + self.navigation_timeout;
        let mut last = -1i64;
        let mut quiet_since = Instant::now();
        loop {
            let count = self
                .execute(RESOURCE_COUNT_SCRIPT, json!([]))
                .await?
                .as_i64()
                .unwrap_or(-1);
            let now = Instant::now();
            if count < 0 || count != last {
                last = count;
                quiet_since = now;
            } else if now.duration_since(quiet_since) >= IDLE_QUIET_PERIOD {
                return Ok(());
            }
            if now >= deadline {
                warn!(target = "dropship.browser", session_id = %self.session_id, "network_idle_timeout");
                return Ok(());
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl Page for WebDriverPage {
    async fn goto(&self, url: &str) -> Result<(), BrowserError> {
        self.call(Method::POST, "/url", Some(json!({ "url": url })))
            .await?;
        self.wait_for_network_idle().await
    }

    async fn texts(&self, selector: &str) -> Result<Vec<String>, BrowserError> {
        let value = self.execute(TEXTS_SCRIPT, json!([selector])).await?;
        Ok(value
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .map(|v| v.as_str().unwrap_or_default().to_string())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn click(&self, selector: &str, index: usize) -> Result<(), BrowserError> {
        let element = self.wait_for_element(selector, index).await?;
        self.call(
            Method::POST,
            &format!("/element/{element}/click"),
            Some(json!({})),
        )
        .await
        .map(|_| ())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), BrowserError> {
        let element = self.wait_for_element(selector, 0).await?;
        self.call(
            Method::POST,
            &format!("/element/{element}/clear"),
            Some(json!({})),
        )
        .await?;
        self.call(
            Method::POST,
            &format!("/element/{element}/value"),
            Some(json!({ "text": value })),
        )
        .await
        .map(|_| ())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError> {
        let value = self.call(Method::GET, "/screenshot", None).await?;
        let encoded = value
            .as_str()
            .ok_or_else(|| BrowserError::Protocol("screenshot is not a string".into()))?;
        BASE64
            .decode(encoded)
            .map_err(|err| BrowserError::Protocol(err.to_string()))
    }

    async fn storage_state(&self) -> Result<StorageState, BrowserError> {
        let cookies = self.call(Method::GET, "/cookie", None).await?;
        let dump = self.execute(DUMP_STORAGE_SCRIPT, json!([])).await?;
        let origin = dump
            .get(0)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let local_storage: BTreeMap<String, String> = dump
            .get(1)
            .and_then(Value::as_str)
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        Ok(StorageState {
            origin,
            cookies: cookies.as_array().cloned().unwrap_or_default(),
            local_storage,
        })
    }

    async fn restore_state(&self, state: &StorageState) -> Result<(), BrowserError> {
        if state.origin.is_empty() {
            return Ok(());
        }
        // Cookies can only be set for the document's own domain.
        self.goto(&state.origin).await?;
        for cookie in &state.cookies {
            if let Err(err) = self
                .call(Method::POST, "/cookie", Some(json!({ "cookie": cookie })))
                .await
            {
                debug!(target = "dropship.browser", error = %err, "cookie_restore_skipped");
            }
        }
        if !state.local_storage.is_empty() {
            self.execute(RESTORE_STORAGE_SCRIPT, json!([state.local_storage]))
                .await?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.session_id);
        self.call(Method::DELETE, "", None).await.map(|_| ())
    }
}

async fn command(
    http: &Client,
    method: Method,
    url: &str,
    body: Option<Value>,
) -> Result<Value, BrowserError> {
    let mut request = http.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }
    let response = request
        .send()
        .await
        .map_err(|err| BrowserError::Transport(err.to_string()))?;
    let status = response.status();
    let payload: Value = response
        .json()
        .await
        .map_err(|err| BrowserError::Protocol(err.to_string()))?;
    let value = payload.get("value").cloned().unwrap_or(Value::Null);
    if status.is_success() {
        return Ok(value);
    }
    let error = value
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if error == "timeout" {
        return Err(BrowserError::Timeout(message));
    }
    Err(BrowserError::Driver { error, message })
}
