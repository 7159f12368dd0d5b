//! Scripted in-memory site used by the browser and pipeline tests.

use crate::browser::{Browser, BrowserError, Page, StorageState};
use async_trait::async_trait;
use serde_json::json;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

/// What the page shows: selector texts plus click transitions.
#[derive(Debug, Clone, Default)]
pub struct Screen {
    texts: HashMap<String, Vec<String>>,
    clicks: HashMap<String, String>,
    broken: Vec<String>,
}

impl Screen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, selector: &str, texts: &[&str]) -> Self {
        self.texts.insert(
            selector.to_string(),
            texts.iter().map(|t| t.to_string()).collect(),
        );
        self
    }

    /// Clicking `selector` moves to screen `next`; the element is made present.
    pub fn on_click(mut self, selector: &str, next: &str) -> Self {
        self.texts
            .entry(selector.to_string())
            .or_insert_with(|| vec![String::new()]);
        self.clicks.insert(selector.to_string(), next.to_string());
        self
    }

    /// Lookups of `selector` fail at the driver.
    pub fn broken(mut self, selector: &str) -> Self {
        self.broken.push(selector.to_string());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct Site {
    screens: HashMap<String, Screen>,
    routes: Vec<(String, String)>,
}

impl Site {
    pub fn screen(mut self, name: &str, screen: Screen) -> Self {
        self.screens.insert(name.to_string(), screen);
        self
    }

    /// URLs containing `fragment` land on `screen`. First match wins.
    pub fn route(mut self, fragment: &str, screen: &str) -> Self {
        self.routes.push((fragment.to_string(), screen.to_string()));
        self
    }
}

#[derive(Debug, Default)]
pub struct Recorder {
    events: Mutex<Vec<String>>,
    pub contexts: AtomicUsize,
    pub close_calls: AtomicUsize,
    pub browser_closed: AtomicBool,
    pub restored: Mutex<Vec<StorageState>>,
}

impl Recorder {
    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn clicked(&self, selector: &str) -> bool {
        self.events()
            .iter()
            .any(|e| e.starts_with(&format!("click {selector}#")))
    }

    pub fn closes(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

pub struct ScriptedBrowser {
    site: Site,
    pub recorder: Arc<Recorder>,
}

impl ScriptedBrowser {
    pub fn new(site: Site) -> Self {
        Self {
            site,
            recorder: Arc::new(Recorder::default()),
        }
    }
}

#[async_trait]
impl Browser for ScriptedBrowser {
    async fn new_context(&self) -> Result<Box<dyn Page>, BrowserError> {
        self.recorder.contexts.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedPage {
            site: self.site.clone(),
            screen: Mutex::new(String::new()),
            recorder: self.recorder.clone(),
        }))
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.recorder.browser_closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct ScriptedPage {
    site: Site,
    screen: Mutex<String>,
    recorder: Arc<Recorder>,
}

impl ScriptedPage {
    fn current(&self) -> Screen {
        let name = self.screen.lock().unwrap().clone();
        self.site.screens.get(&name).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Page for ScriptedPage {
    async fn goto(&self, url: &str) -> Result<(), BrowserError> {
        self.recorder.push(format!("goto {url}"));
        let screen = self
            .site
            .routes
            .iter()
            .find(|(fragment, _)| url.contains(fragment.as_str()))
            .map(|(_, screen)| screen.clone())
            .unwrap_or_default();
        *self.screen.lock().unwrap() = screen;
        Ok(())
    }

    async fn texts(&self, selector: &str) -> Result<Vec<String>, BrowserError> {
        let screen = self.current();
        if screen.broken.iter().any(|broken| broken == selector) {
            return Err(BrowserError::Driver {
                error: "stale element reference".into(),
                message: selector.to_string(),
            });
        }
        Ok(screen.texts.get(selector).cloned().unwrap_or_default())
    }

    async fn click(&self, selector: &str, index: usize) -> Result<(), BrowserError> {
        let screen = self.current();
        let present = screen.texts.get(selector).map(Vec::len).unwrap_or(0);
        if present <= index {
            return Err(BrowserError::Timeout(selector.to_string()));
        }
        self.recorder.push(format!("click {selector}#{index}"));
        if let Some(next) = screen.clicks.get(selector) {
            *self.screen.lock().unwrap() = next.clone();
        }
        Ok(())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), BrowserError> {
        if !self.current().texts.contains_key(selector) {
            return Err(BrowserError::Timeout(selector.to_string()));
        }
        self.recorder.push(format!("fill {selector}={value}"));
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, BrowserError> {
        Ok(b"\x89PNG".to_vec())
    }

    async fn storage_state(&self) -> Result<StorageState, BrowserError> {
        Ok(StorageState {
            origin: "https://shop.test".into(),
            cookies: vec![json!({"name": "session-id", "value": "s1"})],
            local_storage: Default::default(),
        })
    }

    async fn restore_state(&self, state: &StorageState) -> Result<(), BrowserError> {
        self.recorder.restored.lock().unwrap().push(state.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.recorder.close_calls.fetch_add(1, Ordering::SeqCst);
        self.recorder.push("close".into());
        Ok(())
    }
}
