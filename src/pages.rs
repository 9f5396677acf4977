//! Wizard page catalog
//!
//! This module provides the authoritative page catalog and the per-run
//! availability resolution. The catalog is a closed enum so that page
//! dispatch is exhaustiveness-checked at compile time instead of being keyed
//! by strings.
//!
//! # Page Flow
//!
//! ```text
//! language → welcome → keyboard-overview → internet → disk → encrypt
//!     → desktop → confirm → user → region → software → feature
//!     → summary → install → done → restart
//! ```
//!
//! Detour pages (`failed`, `format`, `timezone`, `keyboard-language`,
//! `keyboard-layout`) are reachable by name only and have no position in the
//! linear sequence.

use crate::config_file::InstallerConfig;
use crate::store::{Key, Store, Value};
use strum::{Display, EnumString};

/// A wizard page identifier.
///
/// Variants are ordered as they appear in the linear flow, followed by the
/// detour-only pages. Use [`Page::linear_index`] to distinguish the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum Page {
    Language,
    Welcome,
    // required pre-install info
    KeyboardOverview,
    Internet,
    Disk,
    Encrypt,
    Desktop,
    Confirm,
    // configuration
    User,
    Region,
    Software,
    Feature,
    // fixed block towards end
    Summary,
    Install,
    Done,
    Restart,
    // detour-only pages, reachable by name
    Failed,
    Format,
    Timezone,
    KeyboardLanguage,
    KeyboardLayout,
}

/// Canonical order of the linear wizard flow.
pub const PAGE_ORDER: &[Page] = &[
    Page::Language,
    Page::Welcome,
    Page::KeyboardOverview,
    Page::Internet,
    Page::Disk,
    Page::Encrypt,
    Page::Desktop,
    Page::Confirm,
    Page::User,
    Page::Region,
    Page::Software,
    Page::Feature,
    Page::Summary,
    Page::Install,
    Page::Done,
    Page::Restart,
];

impl Page {
    /// Position of this page in the canonical linear order, or `None` for
    /// detour-only pages.
    pub fn linear_index(self) -> Option<usize> {
        PAGE_ORDER.iter().position(|p| *p == self)
    }

    /// Whether this page is part of the linear flow.
    pub fn is_linear(self) -> bool {
        self.linear_index().is_some()
    }
}

/// Computes the ordered subset of wizard pages applicable to the current run.
///
/// This table is the single source of truth for "is this page relevant".
/// It is evaluated once per run and again after a retranslation reset, since
/// the underlying config values may have been refreshed in between.
pub struct PageAvailabilityResolver;

impl PageAvailabilityResolver {
    /// Filter the canonical catalog through the config-driven predicates.
    ///
    /// Pages without a predicate entry are always included. Resolution has
    /// one side effect: when encryption is offered but forced with a
    /// pre-generated secret, there is nothing left to confirm, so
    /// `use-encryption` is set and the page is dropped from the run.
    pub fn available_pages(config: &InstallerConfig, store: &Store) -> Vec<Page> {
        let included = |page: Page| -> bool {
            match page {
                Page::Language => !config.fixed_language.is_fixed(),
                Page::Welcome => config.welcome_page.usage,
                Page::Internet => config.internet.connection_required,
                Page::Encrypt => Self::offer_encryption(config, store),
                Page::Desktop => !config.desktop.is_empty(),
                Page::Confirm => config.scripts.install.is_some(),
                Page::User => !config.skip_user,
                Page::Region => !config.skip_region,
                Page::Software => !config.additional_software.is_empty(),
                Page::Feature => !config.additional_features.is_empty(),
                _ => true,
            }
        };

        PAGE_ORDER.iter().copied().filter(|p| included(*p)).collect()
    }

    fn offer_encryption(config: &InstallerConfig, store: &Store) -> bool {
        let enc = &config.disk_encryption;
        if !enc.offered {
            false
        } else if enc.forced && enc.generated {
            // nothing for the user to decide, skip the no-op confirmation
            store.set(Key::UseEncryption, Value::Bool(true));
            false
        } else {
            true
        }
    }
}
