use std::{
    path::PathBuf,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions};
use tracing::debug;
use url::Url;

use super::{PageRenderer, RenderedPage};
use crate::{error::UpstreamError, normalize::classify_browser_failure};

const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";
const WINDOW_SIZE: (u32, u32) = (1366, 768);

/// Renders pages in a fresh headless Chrome per call.
#[derive(Debug, Clone, Default)]
pub struct HeadlessChromeRenderer {
    chrome_path: Option<PathBuf>,
}

impl HeadlessChromeRenderer {
    /// `None` lets headless_chrome locate a Chrome/Chromium install itself.
    pub fn new(chrome_path: Option<PathBuf>) -> Self {
        Self { chrome_path }
    }
}

#[async_trait]
impl PageRenderer for HeadlessChromeRenderer {
    async fn render(
        &self,
        url: &Url,
        user_agent: &str,
        navigation_timeout: Duration,
    ) -> Result<RenderedPage, UpstreamError> {
        let chrome_path = self.chrome_path.clone();
        let url = url.to_string();
        let user_agent = user_agent.to_string();
        let session = Arc::new(Session::<Browser>::default());
        // Dropping this future (caller deadline) kills Chrome even while the
        // blocking thread is still waiting inside a CDP call.
        let _teardown = TeardownOnDrop(session.clone());
        tokio::task::spawn_blocking(move || {
            let page = render_blocking(
                &session,
                chrome_path,
                &url,
                &user_agent,
                navigation_timeout,
            );
            drop(session.take());
            page
        })
        .await
        .map_err(|err| {
            UpstreamError::internal("The browser task panicked.").with_details(err.to_string())
        })?
    }
}

/// Slot holding the one handle to a per-call resource, shared between the
/// blocking worker and the async caller. Whoever takes it out drops it.
pub(crate) struct Session<T> {
    resource: Mutex<Option<T>>,
    cancelled: AtomicBool,
}

impl<T> Default for Session<T> {
    fn default() -> Self {
        Self {
            resource: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        }
    }
}

impl<T> Session<T> {
    /// Hands `resource` to the slot. Returns `false`, dropping it on the
    /// spot, when the caller already gave up.
    pub(crate) fn install(&self, resource: T) -> bool {
        let mut slot = self.resource.lock().unwrap_or_else(PoisonError::into_inner);
        if self.cancelled.load(Ordering::SeqCst) {
            drop(slot);
            drop(resource);
            return false;
        }
        *slot = Some(resource);
        true
    }

    pub(crate) fn take(&self) -> Option<T> {
        self.resource
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn cancel(&self) -> Option<T> {
        self.cancelled.store(true, Ordering::SeqCst);
        self.take()
    }
}

pub(crate) struct TeardownOnDrop<T: Send + 'static>(pub(crate) Arc<Session<T>>);

impl<T: Send + 'static> Drop for TeardownOnDrop<T> {
    fn drop(&mut self) {
        let Some(resource) = self.0.cancel() else {
            return;
        };
        debug!("render abandoned, closing browser");
        // Closing Chrome talks to it over CDP; keep that off the async workers.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || drop(resource));
            }
            Err(_) => drop(resource),
        }
    }
}

// The session holds the only `Browser` handle. Tabs do not keep Chrome alive,
// so whichever side drops that handle kills the process.
fn render_blocking(
    session: &Session<Browser>,
    chrome_path: Option<PathBuf>,
    url: &str,
    user_agent: &str,
    navigation_timeout: Duration,
) -> Result<RenderedPage, UpstreamError> {
    let options = LaunchOptions::default_builder()
        .headless(true)
        .sandbox(false)
        .path(chrome_path)
        .window_size(Some(WINDOW_SIZE))
        .idle_browser_timeout(navigation_timeout * 2)
        .build()
        .map_err(|err| {
            UpstreamError::internal("Invalid headless browser options.")
                .with_details(err.to_string())
        })?;
    let browser = Browser::new(options)
        .map_err(|err| classify_browser_failure("launching", &format!("{err:#}")))?;
    let tab = browser
        .new_tab()
        .map_err(|err| classify_browser_failure("opening a tab", &format!("{err:#}")))?;
    if !session.install(browser) {
        return Err(UpstreamError::timeout("TikTok page load"));
    }
    tab.set_default_timeout(navigation_timeout);
    tab.set_user_agent(user_agent, Some(ACCEPT_LANGUAGE), None)
        .map_err(|err| classify_browser_failure("configuring the tab", &format!("{err:#}")))?;

    debug!(url, "navigating headless browser");
    tab.navigate_to(url)
        .and_then(|tab| tab.wait_until_navigated())
        .map_err(|err| classify_browser_failure("navigating", &format!("{err:#}")))?;

    let html = tab
        .get_content()
        .map_err(|err| classify_browser_failure("reading the page", &format!("{err:#}")))?;
    let cookie_header = match tab.get_cookies() {
        Ok(cookies) => Some(
            cookies
                .iter()
                .map(|cookie| format!("{}={}", cookie.name, cookie.value))
                .collect::<Vec<_>>()
                .join("; "),
        )
        .filter(|header| !header.is_empty()),
        Err(err) => {
            debug!(error = %err, "could not read page cookies");
            None
        }
    };

    Ok(RenderedPage {
        html,
        cookie_header,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records when it is dropped, standing in for a browser process.
    struct Process(Arc<AtomicBool>);

    impl Drop for Process {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    async fn hold_while_blocked(session: Arc<Session<Process>>, killed: Arc<AtomicBool>) {
        let _teardown = TeardownOnDrop(session.clone());
        let worker = session.clone();
        let _ = tokio::task::spawn_blocking(move || {
            worker.install(Process(killed));
            std::thread::sleep(Duration::from_secs(2));
            drop(worker.take());
        })
        .await;
    }

    #[tokio::test]
    async fn abandoned_render_releases_resource_immediately() {
        let killed = Arc::new(AtomicBool::new(false));
        let session = Arc::new(Session::default());
        let outcome = tokio::time::timeout(
            Duration::from_millis(200),
            hold_while_blocked(session.clone(), killed.clone()),
        )
        .await;
        assert!(outcome.is_err());

        let mut released = false;
        for _ in 0..20 {
            if killed.load(Ordering::SeqCst) {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(released, "resource outlived the abandoned render");
        assert!(session.take().is_none());
    }

    #[test]
    fn install_after_cancel_drops_at_once() {
        let killed = Arc::new(AtomicBool::new(false));
        let session = Session::default();
        assert!(session.cancel().is_none());
        assert!(!session.install(Process(killed.clone())));
        assert!(killed.load(Ordering::SeqCst));
        assert!(session.take().is_none());
    }

    #[test]
    fn completed_render_leaves_nothing_to_tear_down() {
        let killed = Arc::new(AtomicBool::new(false));
        let session = Arc::new(Session::default());
        assert!(session.install(Process(killed.clone())));
        drop(session.take());
        assert!(killed.load(Ordering::SeqCst));
        drop(TeardownOnDrop(session.clone()));
        assert!(session.cancelled.load(Ordering::SeqCst));
    }
}
