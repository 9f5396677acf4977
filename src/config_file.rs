//! Configuration file handling for the wizard.
//!
//! The distributor ships a declarative YAML file describing what the wizard
//! offers (scripts, pages, encryption policy, software choices). This module
//! loads that file into typed structs, providing schema validation at
//! deserialization time instead of scattered runtime type assertions.
//!
//! Loading never fails the program: any problem (missing file, syntax error,
//! schema violation) is logged with its precise cause and the wizard degrades
//! to the hardcoded defaults in demo mode. An installer that crashes on a bad
//! config is worse than one that runs a harmless demo.
//!
//! Merge semantics follow the per-field serde defaults: a section present in
//! the file overrides only the sub-keys it names, scalar and list values
//! replace the default wholesale. Legacy top-level keys are rewritten by a
//! single migration pass over the raw document before typed deserialization.

use anyhow::{Context, Result};
use serde::de::{Deserializer, Error as DeError, Visitor};
use serde::Deserialize;
use serde_yaml::{Mapping, Value as Yaml};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, warn};

const GIGABYTE_FACTOR: u64 = 1000 * 1000 * 1000;

/// How this run may touch the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Regular installation run.
    #[default]
    Default,
    /// Runs scripts but does not alter system settings.
    Test,
    /// Never alters the system; script failures are tolerated.
    Demo,
}

impl RunMode {
    pub fn is_demo(self) -> bool {
        self == RunMode::Demo
    }

    pub fn is_test(self) -> bool {
        self == RunMode::Test
    }

    /// Resolve the command-line mode flags. Demo wins when both are given.
    pub fn from_flags(demo_mode: bool, test_mode: bool) -> Self {
        if demo_mode && test_mode {
            warn!("Only one of demo and test mode can be set at a time, using demo mode");
            RunMode::Demo
        } else if demo_mode {
            RunMode::Demo
        } else if test_mode {
            RunMode::Test
        } else {
            RunMode::Default
        }
    }
}

/// Paths of the three stage scripts. A `None` stage is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct Scripts {
    pub prepare: Option<PathBuf>,
    pub install: Option<PathBuf>,
    pub configure: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct InternetConfig {
    pub connection_required: bool,
    pub checker_url: String,
}

impl Default for InternetConfig {
    fn default() -> Self {
        Self {
            connection_required: true,
            checker_url: "http://nmcheck.gnome.org/check_network_status.txt".into(),
        }
    }
}

/// Either language selection is offered, or the distributor pins a language.
///
/// The YAML value is `false` (offer selection) or a language code. A bare
/// `true` is rejected: a fixed language without saying which one is a
/// configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FixedLanguage {
    #[default]
    Disabled,
    Fixed(String),
}

impl FixedLanguage {
    pub fn is_fixed(&self) -> bool {
        matches!(self, FixedLanguage::Fixed(_))
    }
}

impl<'de> Deserialize<'de> for FixedLanguage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct FixedLanguageVisitor;

        impl Visitor<'_> for FixedLanguageVisitor {
            type Value = FixedLanguage;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("false or a language code")
            }

            fn visit_bool<E: DeError>(self, v: bool) -> std::result::Result<Self::Value, E> {
                if v {
                    Err(E::custom(
                        "fixed_language must name a language code or be disabled with false",
                    ))
                } else {
                    Ok(FixedLanguage::Disabled)
                }
            }

            fn visit_str<E: DeError>(self, v: &str) -> std::result::Result<Self::Value, E> {
                Ok(FixedLanguage::Fixed(v.to_owned()))
            }
        }

        deserializer.deserialize_any(FixedLanguageVisitor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WelcomePage {
    pub usage: bool,
    pub logo: Option<String>,
    pub text: Option<String>,
}

impl Default for WelcomePage {
    fn default() -> Self {
        Self {
            usage: true,
            logo: None,
            text: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    pub partition_ok: bool,
    /// Minimum target size in bytes. Written as gigabytes in the file and
    /// converted exactly once while deserializing.
    #[serde(deserialize_with = "de_gigabytes")]
    pub min_size: u64,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            partition_ok: false,
            min_size: 5 * GIGABYTE_FACTOR,
        }
    }
}

fn de_gigabytes<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    let gigabytes = f64::deserialize(deserializer)?;
    if !gigabytes.is_finite() || gigabytes < 0.0 {
        return Err(D::Error::custom("disk size must be a non-negative number"));
    }
    Ok((gigabytes * GIGABYTE_FACTOR as f64) as u64)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DiskEncryption {
    pub offered: bool,
    pub forced: bool,
    pub generated: bool,
    pub min_length: u32,
    pub confirmation: bool,
}

impl Default for DiskEncryption {
    fn default() -> Self {
        Self {
            offered: true,
            forced: false,
            generated: false,
            min_length: 1,
            confirmation: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub min_password_length: u32,
    pub request_username: bool,
    pub provide_autologin: bool,
    pub password_confirmation: bool,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            min_password_length: 1,
            request_username: false,
            provide_autologin: false,
            password_confirmation: false,
        }
    }
}

/// A desktop environment offered on the desktop page.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct DesktopEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon_path: String,
}

/// One selectable option inside a multi-option choice.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChoiceOption {
    pub option: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// A software or feature choice offered to the user.
///
/// Either `keyword` (with an optional `suggested` preselection) or a list of
/// `options` is set, never both.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct ChoiceEntry {
    pub name: String,
    pub description: String,
    pub icon_path: String,
    pub keyword: Option<String>,
    pub suggested: bool,
    pub options: Vec<ChoiceOption>,
    // superseded spellings of `keyword`, rewritten by normalize()
    package: Option<String>,
    feature: Option<String>,
}

impl ChoiceEntry {
    /// A keyword choice as the loader would produce it.
    pub fn with_keyword(name: &str, keyword: &str) -> Self {
        Self {
            name: name.into(),
            keyword: Some(keyword.into()),
            ..Default::default()
        }
    }

    /// Rewrite legacy entry keys and decide whether the entry is usable.
    fn normalize(&mut self) -> bool {
        for legacy in [self.package.take(), self.feature.take()] {
            if let Some(keyword) = legacy {
                warn!(
                    "Choice {}: syntax changed, use 'keyword' instead of 'package'/'feature'",
                    self.name
                );
                self.keyword.get_or_insert(keyword);
            }
        }

        if self.keyword.is_some() && !self.options.is_empty() {
            warn!("Choice {}: 'options' can't be used with 'keyword'", self.name);
            return false;
        }
        if self.keyword.is_none() && self.options.is_empty() {
            warn!("Choice {} not correctly configured, no keyword found", self.name);
            return false;
        }
        true
    }
}

/// External helper commands invoked from the wizard's pages.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Commands {
    pub browser: String,
    pub disks: String,
    pub reboot: String,
    pub wifi: String,
}

impl Default for Commands {
    fn default() -> Self {
        Self {
            browser: "epiphany".into(),
            disks: "gnome-disks".into(),
            reboot: "reboot".into(),
            wifi: "gnome-control-center wifi".into(),
        }
    }
}

/// The full file-configurable schema with its hardcoded defaults.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    pub distribution_name: DistributionName,
    pub scripts: Scripts,
    pub internet: InternetConfig,
    pub fixed_language: FixedLanguage,
    pub welcome_page: WelcomePage,
    pub disk: DiskConfig,
    pub disk_encryption: DiskEncryption,
    pub desktop: Vec<DesktopEntry>,
    pub user: UserConfig,
    pub skip_region: bool,
    pub skip_user: bool,
    pub additional_software: Vec<ChoiceEntry>,
    pub additional_features: Vec<ChoiceEntry>,
    pub install_slideshow: Vec<String>,
    pub failure_help_url: FailureHelpUrl,
    pub commands: Commands,
}

/// Newtype keeping the "Untitled" default close to the field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct DistributionName(pub String);

impl Default for DistributionName {
    fn default() -> Self {
        Self("Untitled".into())
    }
}

impl fmt::Display for DistributionName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct FailureHelpUrl(pub String);

impl Default for FailureHelpUrl {
    fn default() -> Self {
        Self("https://duckduckgo.com/?q=\"os-installer {}\"+\"failed installation\"".into())
    }
}

impl FailureHelpUrl {
    /// The help-search URL offered on the failure page, with the `{}`
    /// placeholder filled in.
    pub fn for_distribution(&self, name: &str) -> String {
        self.0.replace("{}", name)
    }
}

impl InstallerConfig {
    /// Check the cross-field invariants serde cannot express.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.scripts.install.is_none() && self.scripts.configure.is_none() {
            return Err(
                "Either install or configure script must exist. \
                 This setup will not be able to install anything."
                    .into(),
            );
        }
        Ok(())
    }

    fn normalize_choices(&mut self) {
        self.additional_software.retain_mut(ChoiceEntry::normalize);
        self.additional_features.retain_mut(ChoiceEntry::normalize);
    }
}

/// Result of a config load: the effective config plus the effective run mode.
#[derive(Debug, Clone)]
pub struct Loaded {
    pub config: InstallerConfig,
    pub run_mode: RunMode,
}

/// Load the config file, degrading to defaults + demo mode on any failure.
pub fn load(path: &Path, requested: RunMode) -> Loaded {
    match try_load(path) {
        Ok(config) => Loaded {
            config,
            run_mode: requested,
        },
        Err(err) => {
            warn!("{err:#}. Running in demo mode.");
            let config = InstallerConfig::default();
            if requested.is_test() {
                // developer sanity check, the defaults must never be broken
                if let Err(e) = config.validate() {
                    error!("Developer error: default config contains errors: {e}");
                }
            }
            Loaded {
                config,
                run_mode: RunMode::Demo,
            }
        }
    }
}

fn try_load(path: &Path) -> Result<InstallerConfig> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Could not find config file {}", path.display()))?;
    let mut document: Mapping =
        serde_yaml::from_str(&text).context("Check if the config contains syntax errors")?;

    migrate_legacy(&mut document);
    drop_unknown(&mut document);

    let mut config: InstallerConfig =
        serde_yaml::from_value(Yaml::Mapping(document)).context("Config errors")?;
    config.normalize_choices();
    config.validate().map_err(anyhow::Error::msg)?;
    Ok(config)
}

const KNOWN_KEYS: &[&str] = &[
    "distribution_name",
    "scripts",
    "internet",
    "fixed_language",
    "welcome_page",
    "disk",
    "disk_encryption",
    "desktop",
    "user",
    "skip_region",
    "skip_user",
    "additional_software",
    "additional_features",
    "install_slideshow",
    "failure_help_url",
    "commands",
];

/// Translate deprecated top-level keys into their current locations.
///
/// Runs once, before typed deserialization, so the rest of the loader only
/// ever sees the current schema. Old names are never kept.
fn migrate_legacy(document: &mut Mapping) {
    // moved keys: old name → (section, sub-key)
    const MOVED: &[(&str, &str, &str)] = &[
        ("minimum_disk_size", "disk", "min_size"),
        ("internet_connection_required", "internet", "connection_required"),
        ("internet_checker_url", "internet", "checker_url"),
        ("browser_cmd", "commands", "browser"),
        ("disks_cmd", "commands", "disks"),
        ("wifi_cmd", "commands", "wifi"),
    ];

    for (old, section, sub_key) in MOVED {
        if let Some(value) = document.remove(*old) {
            warn!("Developer hint: \"{old}\" is deprecated, use \"{section} -> {sub_key}\" instead");
            nested_entry(document, section).insert(Yaml::from(*sub_key), value);
        }
    }

    if let Some(value) = document.remove("skip_locale") {
        warn!("Developer hint: \"skip_locale\" is deprecated, use \"skip_region\" instead");
        document.entry(Yaml::from("skip_region")).or_insert(value);
    }

    if document.remove("suggested_languages").is_some() {
        warn!(
            "Developer hint: \"suggested_languages\" has been removed, \
             instead all languages with translations are listed"
        );
    }

    // conditional replacement: a disabled offer now implies the stricter
    // encryption defaults instead of merely flipping the offered flag
    if let Some(value) = document.remove("offer_disk_encryption") {
        warn!("Developer hint: \"offer_disk_encryption\" is deprecated, use \"disk_encryption\" instead");
        if value == Yaml::Bool(true) {
            nested_entry(document, "disk_encryption").insert(Yaml::from("offered"), Yaml::Bool(true));
        } else {
            let mut replacement = Mapping::new();
            replacement.insert(Yaml::from("offered"), Yaml::Bool(false));
            replacement.insert(Yaml::from("forced"), Yaml::Bool(false));
            replacement.insert(Yaml::from("min_length"), Yaml::from(1));
            document.insert(Yaml::from("disk_encryption"), Yaml::Mapping(replacement));
        }
    }
}

fn nested_entry<'a>(document: &'a mut Mapping, section: &str) -> &'a mut Mapping {
    let entry = document
        .entry(Yaml::from(section))
        .or_insert_with(|| Yaml::Mapping(Mapping::new()));
    if !entry.is_mapping() {
        // a scalar where a section belongs; the typed pass will report it
        *entry = Yaml::Mapping(Mapping::new());
    }
    entry.as_mapping_mut().expect("just ensured mapping")
}

fn drop_unknown(document: &mut Mapping) {
    let unknown: Vec<Yaml> = document
        .keys()
        .filter(|key| {
            key.as_str()
                .map(|name| !KNOWN_KEYS.contains(&name))
                .unwrap_or(true)
        })
        .cloned()
        .collect();
    for key in unknown {
        warn!(
            "Ignoring unknown config for \"{}\"",
            key.as_str().unwrap_or("<non-string key>")
        );
        document.remove(&key);
    }
}
