//! Navigation state machine.
//!
//! Tracks which wizard page is shown, which pages are loaded, and how far
//! the user has ever advanced. All mutating operations take one mutex for
//! their whole body; the stage-unlock side effects of a transition run while
//! that mutex is held so the unlock order is deterministic against
//! concurrent calls, and the pipeline in turn never calls back into
//! navigation synchronously (its requests travel through the store and are
//! executed by the event loop).
//!
//! # Transition milestones
//!
//! Walking forward past certain pages has side effects:
//!
//! - `disk` unlocks the `prepare` stage
//! - `user`, entered from `confirm`, unlocks `install` and is irreversible
//! - `install` unlocks `configure` and is irreversible
//! - `summary`, `done`, `restart` are irreversible
//!
//! An irreversible ("no-return") transition tears down every other loaded
//! page: disk writes or script execution have begun and there is nothing to
//! go back to. Leaving the `language` page instead tears down everything but
//! `language`, because every other page's translated text is now stale.

use crate::config_file::InstallerConfig;
use crate::error::{Result, WizardError};
use crate::pages::{Page, PageAvailabilityResolver, PAGE_ORDER};
use crate::scripting::InstallationPipeline;
use crate::store::{Key, OwnerId, PageRequest, Store, Value};
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

/// Outcome of a transition that the caller must act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionEffect {
    /// Discard every loaded page except the one just reached.
    NoReturn,
    /// Discard every loaded page except `language`; translations are stale.
    Retranslate,
}

struct PageEntry {
    owner: OwnerId,
    permanent: bool,
}

struct NavState {
    available: Vec<Page>,
    /// Index into [`PAGE_ORDER`] of the furthest page ever reached.
    latest_page: usize,
    pages: HashMap<Page, PageEntry>,
    /// Visible page stack; the last element is the displayed page.
    stack: Vec<Page>,
}

pub struct Navigation {
    store: Arc<Store>,
    config: Arc<InstallerConfig>,
    pipeline: Arc<InstallationPipeline>,
    inner: Mutex<NavState>,
}

impl Navigation {
    pub fn new(
        store: Arc<Store>,
        config: Arc<InstallerConfig>,
        pipeline: Arc<InstallationPipeline>,
    ) -> Self {
        let available = PageAvailabilityResolver::available_pages(&config, &store);
        let first = *available.first().expect("page catalog is never empty");

        let navigation = Self {
            store,
            config,
            pipeline,
            inner: Mutex::new(NavState {
                available,
                latest_page: 0,
                pages: HashMap::new(),
                stack: Vec::new(),
            }),
        };

        {
            let mut state = navigation.inner.lock().expect("navigation lock");
            navigation.load_page(&mut state, first, true);
        }

        // with no connectivity requirement there is nothing to wait for
        // before mirror preparation may start
        if !navigation.config.internet.connection_required {
            navigation.pipeline.can_run_prepare();
        }

        navigation
    }

    /// The currently displayed page.
    pub fn current_page(&self) -> Page {
        *self
            .inner
            .lock()
            .expect("navigation lock")
            .stack
            .last()
            .expect("stack is never empty")
    }

    /// The furthest linear page ever reached in this run.
    pub fn furthest_page(&self) -> Page {
        PAGE_ORDER[self.inner.lock().expect("navigation lock").latest_page]
    }

    pub fn available_pages(&self) -> Vec<Page> {
        self.inner.lock().expect("navigation lock").available.clone()
    }

    pub fn is_page_available(&self, page: Page) -> bool {
        self.inner
            .lock()
            .expect("navigation lock")
            .available
            .contains(&page)
    }

    /// The subscription owner of a loaded page, if it is loaded.
    pub fn page_owner(&self, page: Page) -> Option<OwnerId> {
        self.inner
            .lock()
            .expect("navigation lock")
            .pages
            .get(&page)
            .map(|entry| entry.owner)
    }

    /// Advance past `from`.
    ///
    /// `from` is the page the caller believes is displayed; if it has since
    /// been replaced the call is a stale no-op. Detour pages pop back to
    /// their entry point instead of advancing.
    pub fn advance(&self, from: Option<Page>) {
        let mut state = self.inner.lock().expect("navigation lock");
        self.advance_locked(&mut state, from);
    }

    /// Pop the navigation stack by one.
    pub fn go_backward(&self) {
        let mut state = self.inner.lock().expect("navigation lock");
        self.pop_page(&mut state);
    }

    /// Load `page` as a detour outside the linear sequence.
    ///
    /// Loading a page twice is a caller bug: detours are popped on exit, so
    /// a loaded one is either displayed or pending on the stack already.
    pub fn navigate_to_page(&self, page: Page) -> Result<()> {
        let mut state = self.inner.lock().expect("navigation lock");
        if state.pages.contains_key(&page) {
            error!(
                "Internal error: detour page {page} is already loaded\n{}",
                Backtrace::force_capture()
            );
            return Err(WizardError::navigation(format!(
                "detour page {page} is already loaded"
            )));
        }
        self.load_page(&mut state, page, false);
        Ok(())
    }

    /// Load the terminal failure page, or raise it if already loaded.
    pub fn show_failed(&self) {
        let mut state = self.inner.lock().expect("navigation lock");
        self.load_page(&mut state, Page::Failed, false);
    }

    /// Execute a pending `displayed-page` request, if any.
    ///
    /// Called from the event loop. The request is stolen from the store so
    /// it fires exactly once.
    pub fn handle_request(&self) {
        let request = match self.store.steal(Key::DisplayedPage) {
            Some(Value::Request(request)) => request,
            Some(other) => {
                error!(
                    "Internal error: displayed-page held {other:?}\n{}",
                    Backtrace::force_capture()
                );
                return;
            }
            None => return,
        };

        match request {
            PageRequest::Next(from) => self.advance(from),
            PageRequest::Show(Page::Failed) => self.show_failed(),
            PageRequest::Show(page) => {
                if let Err(e) = self.navigate_to_page(page) {
                    // stale request for a page that got loaded meanwhile
                    debug!("Ignoring page request: {e}");
                }
            }
        }
    }

    fn advance_locked(&self, state: &mut NavState, from: Option<Page>) {
        let current = *state.stack.last().expect("stack is never empty");

        // confirm the calling page is the current page to prevent incorrect
        // navigation from a page that has since been replaced
        if let Some(from) = from {
            if from != current {
                debug!("Ignoring stale advance from {from}, displayed page is {current}");
                return;
            }
        }

        let permanent = state
            .pages
            .get(&current)
            .map(|entry| entry.permanent)
            .unwrap_or(true);
        if !permanent {
            // leaving a detour returns to the page that launched it
            self.pop_page(state);
            return;
        }

        let Some(next) = self.next_page_name(state, current) else {
            return;
        };

        match self.transition(state, current, next) {
            Some(TransitionEffect::NoReturn) => {
                self.remove_all_pages(state, None);
            }
            Some(TransitionEffect::Retranslate) => {
                self.remove_all_pages(state, Some(Page::Language));
                state.latest_page = 0;
                state.available =
                    PageAvailabilityResolver::available_pages(&self.config, &self.store);
            }
            None => {}
        }

        self.load_page(state, next, true);
    }

    /// The core rule engine: walk every page newly reached between the
    /// previous high-water mark and `reached`, applying milestone side
    /// effects in catalog order, then raise the mark.
    ///
    /// Backward and lateral moves have no side effects; leaving `language`
    /// signals a retranslation regardless of direction.
    fn transition(&self, state: &mut NavState, prev: Page, reached: Page) -> Option<TransitionEffect> {
        let mut effect = (prev == Page::Language).then_some(TransitionEffect::Retranslate);

        let Some(new_index) = reached.linear_index() else {
            return effect;
        };
        if state.latest_page >= new_index {
            return effect;
        }

        for page in &PAGE_ORDER[state.latest_page + 1..=new_index] {
            match page {
                Page::Disk => self.pipeline.can_run_prepare(),
                Page::User => {
                    if prev == Page::Confirm {
                        // the disk has been committed to
                        self.pipeline.can_run_install();
                        effect = Some(TransitionEffect::NoReturn);
                    }
                }
                Page::Install => {
                    self.pipeline.can_run_configure();
                    effect = Some(TransitionEffect::NoReturn);
                }
                Page::Done | Page::Failed | Page::Restart | Page::Summary => {
                    effect = Some(TransitionEffect::NoReturn);
                }
                _ => {}
            }
        }
        state.latest_page = new_index;

        effect
    }

    fn next_page_name(&self, state: &NavState, current: Page) -> Option<Page> {
        let index = state.available.iter().position(|p| *p == current)?;
        state.available.get(index + 1).copied()
    }

    fn load_page(&self, state: &mut NavState, page: Page, permanent: bool) {
        if state.pages.contains_key(&page) {
            // reuse the existing page if it is still loaded
            if state.stack.last() != Some(&page) {
                state.stack.push(page);
            }
        } else {
            let owner = self.store.new_owner();
            state.pages.insert(page, PageEntry { owner, permanent });
            state.stack.push(page);
            debug!("Loaded page {page}");
        }
    }

    fn pop_page(&self, state: &mut NavState) {
        if state.stack.len() <= 1 {
            return;
        }
        let popped = state.stack.pop().expect("stack has more than one page");

        // permanent pages stay loaded for reuse; a popped detour is gone
        let discard = state
            .pages
            .get(&popped)
            .map(|entry| !entry.permanent)
            .unwrap_or(false)
            && !state.stack.contains(&popped);
        if discard {
            self.drop_page(state, popped);
        }
    }

    fn remove_all_pages(&self, state: &mut NavState, exception: Option<Page>) {
        state.stack.retain(|page| Some(*page) == exception);
        let doomed: Vec<Page> = state
            .pages
            .keys()
            .copied()
            .filter(|page| Some(*page) != exception)
            .collect();
        for page in doomed {
            self.drop_page(state, page);
        }
    }

    /// Free a page and everything it subscribed to.
    fn drop_page(&self, state: &mut NavState, page: Page) {
        if let Some(entry) = state.pages.remove(&page) {
            self.store.unsubscribe_owner(entry.owner);
            debug!("Dropped page {page}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_file::{ChoiceEntry, DesktopEntry, RunMode, Scripts};
    use crate::scripting::Stage;
    use crate::store::Dispatch;
    use crate::terminal::TerminalSink;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A config keeping every conditional page in the run. Script paths do
    /// not exist on disk, so unlocked stages are skipped rather than run.
    fn full_config() -> InstallerConfig {
        let mut config = InstallerConfig::default();
        config.scripts = Scripts {
            prepare: None,
            install: Some(PathBuf::from("/nonexistent/install.sh")),
            configure: Some(PathBuf::from("/nonexistent/configure.sh")),
        };
        config.desktop = vec![DesktopEntry {
            name: "GNOME".into(),
            ..Default::default()
        }];
        config.additional_software = vec![ChoiceEntry::with_keyword("Office", "office")];
        config.additional_features = config.additional_software.clone();
        config
    }

    fn build(config: InstallerConfig) -> (Arc<Store>, Arc<InstallationPipeline>, Navigation) {
        let store = Arc::new(Store::new());
        store.mark_initialized();
        let config = Arc::new(config);
        let pipeline = InstallationPipeline::new(
            Arc::clone(&store),
            config.scripts.clone(),
            RunMode::Demo,
            Arc::new(TerminalSink::new()),
        );
        let navigation = Navigation::new(Arc::clone(&store), config, Arc::clone(&pipeline));
        (store, pipeline, navigation)
    }

    fn advance_current(navigation: &Navigation) {
        navigation.advance(Some(navigation.current_page()));
    }

    #[test]
    fn test_starts_on_first_available_page() {
        let (_, _, navigation) = build(full_config());
        assert_eq!(navigation.current_page(), Page::Language);
    }

    #[test]
    fn test_linear_advance_follows_available_pages() {
        let (_, _, navigation) = build(full_config());
        advance_current(&navigation);
        assert_eq!(navigation.current_page(), Page::Welcome);
        advance_current(&navigation);
        assert_eq!(navigation.current_page(), Page::KeyboardOverview);
    }

    #[test]
    fn test_stale_advance_is_ignored() {
        let (_, _, navigation) = build(full_config());
        advance_current(&navigation);
        assert_eq!(navigation.current_page(), Page::Welcome);

        // a callback of the replaced language page fires late
        navigation.advance(Some(Page::Language));
        assert_eq!(navigation.current_page(), Page::Welcome);
    }

    #[test]
    fn test_advance_without_guard_always_applies() {
        let (_, _, navigation) = build(full_config());
        navigation.advance(None);
        assert_eq!(navigation.current_page(), Page::Welcome);
    }

    #[test]
    fn test_go_backward_pops() {
        let (_, _, navigation) = build(full_config());
        advance_current(&navigation);
        advance_current(&navigation);
        navigation.go_backward();
        assert_eq!(navigation.current_page(), Page::Welcome);
        navigation.go_backward();
        assert_eq!(navigation.current_page(), Page::Language);
        // cannot pop below the first page
        navigation.go_backward();
        assert_eq!(navigation.current_page(), Page::Language);
    }

    #[test]
    fn test_detour_pushes_and_pops() {
        let (store, _, navigation) = build(full_config());
        advance_current(&navigation);
        assert_eq!(navigation.current_page(), Page::Welcome);

        navigation.navigate_to_page(Page::Timezone).unwrap();
        assert_eq!(navigation.current_page(), Page::Timezone);
        let owner = navigation.page_owner(Page::Timezone).unwrap();

        // loading the same detour twice is rejected
        assert!(navigation.navigate_to_page(Page::Timezone).is_err());

        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        store.subscribe(Key::Timezone, owner, Dispatch::Deferred, move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        // advancing a detour page returns to its entry point
        advance_current(&navigation);
        assert_eq!(navigation.current_page(), Page::Welcome);
        assert_eq!(navigation.page_owner(Page::Timezone), None);

        // the discarded page's subscriptions are gone with it
        store.set(Key::Timezone, Value::Str("Europe/Oslo".into()));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reaching_disk_unlocks_prepare() {
        let (_, pipeline, navigation) = build(full_config());
        assert_eq!(pipeline.ready_step(), Stage::None);
        for _ in 0..4 {
            advance_current(&navigation);
        }
        assert_eq!(navigation.current_page(), Page::Disk);
        assert_eq!(pipeline.ready_step(), Stage::Prepare);
    }

    #[test]
    fn test_no_internet_requirement_unlocks_prepare_at_start() {
        let mut config = full_config();
        config.internet.connection_required = false;
        let (_, pipeline, _) = build(config);
        assert_eq!(pipeline.ready_step(), Stage::Prepare);
    }

    #[test]
    fn test_user_from_confirm_is_no_return() {
        let (_, pipeline, navigation) = build(full_config());
        // language .. confirm
        for _ in 0..7 {
            advance_current(&navigation);
        }
        assert_eq!(navigation.current_page(), Page::Confirm);

        advance_current(&navigation);
        assert_eq!(navigation.current_page(), Page::User);
        assert_eq!(pipeline.ready_step(), Stage::Install);
        // every earlier page has been torn down
        assert_eq!(navigation.page_owner(Page::Confirm), None);
        assert_eq!(navigation.page_owner(Page::Language), None);
        assert!(navigation.page_owner(Page::User).is_some());

        // going backward from a no-return milestone leads nowhere
        navigation.go_backward();
        assert_eq!(navigation.current_page(), Page::User);
    }

    #[test]
    fn test_user_without_confirm_is_reversible() {
        // no install script: the confirm page is dropped from the run and
        // user is reached from desktop
        let mut config = full_config();
        config.scripts.install = None;
        config.scripts.configure = Some(PathBuf::from("/nonexistent/configure.sh"));
        let (_, pipeline, navigation) = build(config);

        for _ in 0..7 {
            advance_current(&navigation);
        }
        assert_eq!(navigation.current_page(), Page::User);
        // install is not unlocked and earlier pages survive
        assert_eq!(pipeline.ready_step(), Stage::Prepare);
        assert!(navigation.page_owner(Page::Desktop).is_some());

        navigation.go_backward();
        assert_eq!(navigation.current_page(), Page::Desktop);
    }

    #[test]
    fn test_leaving_language_retranslates() {
        let (_, _, navigation) = build(full_config());
        advance_current(&navigation);
        advance_current(&navigation);
        assert_eq!(navigation.current_page(), Page::KeyboardOverview);

        // back to language and forward again: everything cached is stale
        navigation.go_backward();
        navigation.go_backward();
        assert_eq!(navigation.current_page(), Page::Language);
        advance_current(&navigation);

        assert_eq!(navigation.current_page(), Page::Welcome);
        assert!(navigation.page_owner(Page::Language).is_some());
        assert!(navigation.page_owner(Page::Welcome).is_some());
        // keyboard-overview was rebuilt away
        assert_eq!(navigation.page_owner(Page::KeyboardOverview), None);
    }

    #[test]
    fn test_latest_page_is_monotonic_across_backward_moves() {
        let (_, pipeline, navigation) = build(full_config());
        for _ in 0..4 {
            advance_current(&navigation);
        }
        assert_eq!(navigation.current_page(), Page::Disk);

        navigation.go_backward();
        assert_eq!(navigation.current_page(), Page::Internet);
        // re-walking already-visited pages re-triggers no milestones:
        // prepare stays unlocked, install stays locked
        advance_current(&navigation);
        advance_current(&navigation);
        assert_eq!(navigation.current_page(), Page::Encrypt);
        assert_eq!(pipeline.ready_step(), Stage::Prepare);
    }

    #[test]
    fn test_handle_request_advances_and_shows() {
        let (store, _, navigation) = build(full_config());

        store.request_advance(None);
        navigation.handle_request();
        assert_eq!(navigation.current_page(), Page::Welcome);

        store.request_page(Page::Failed);
        navigation.handle_request();
        assert_eq!(navigation.current_page(), Page::Failed);

        // the request was stolen; handling again is a no-op
        navigation.handle_request();
        assert_eq!(navigation.current_page(), Page::Failed);
    }

    #[test]
    fn test_full_walk_reaches_restart() {
        let (_, pipeline, navigation) = build(full_config());
        // walk the entire linear flow
        for _ in 0..PAGE_ORDER.len() {
            advance_current(&navigation);
        }
        assert_eq!(navigation.current_page(), Page::Restart);
        // advancing past the end changes nothing
        advance_current(&navigation);
        assert_eq!(navigation.current_page(), Page::Restart);
        // all three stages were unlocked along the way
        assert_eq!(pipeline.ready_step(), Stage::Configure);
    }
}
