//! Environment construction for stage scripts.
//!
//! The stage scripts are written by distributors against a fixed `OSI_*`
//! variable contract; this module is the single place that contract lives.
//! A required key missing from the store is emitted as an empty string with a
//! developer warning rather than aborting the spawn.

use crate::scripting::Stage;
use crate::store::{Key, Store, Value};
use tracing::warn;

/// Build the environment for `stage`.
///
/// `install` gets the disk/locale block; `configure` gets that block plus the
/// user/region/software block. `prepare` runs with no wizard variables.
pub fn create_envs(store: &Store, stage: Stage) -> Vec<(String, String)> {
    let with_configure_envs = stage == Stage::Configure;
    let with_install_envs = stage == Stage::Install || with_configure_envs;

    let mut envs = Vec::new();
    if with_install_envs {
        envs.push(("OSI_LOCALE".into(), get_str(store, Key::Locale)));
        envs.push(("OSI_KEYBOARD_LAYOUT".into(), get_code(store, Key::KeyboardLayout)));
        envs.push(("OSI_DEVICE_PATH".into(), get_str(store, Key::DevicePath)));
        envs.push(("OSI_DEVICE_IS_PARTITION".into(), get_str(store, Key::DeviceIsPartition)));
        envs.push(("OSI_DEVICE_EFI_PARTITION".into(), get_str(store, Key::DeviceEfiPartition)));
        envs.push(("OSI_USE_ENCRYPTION".into(), get_str(store, Key::UseEncryption)));
        envs.push(("OSI_ENCRYPTION_PIN".into(), get_str(store, Key::EncryptionPin)));
    }

    if with_configure_envs {
        envs.push(("OSI_USER_NAME".into(), get_str(store, Key::UserName)));
        envs.push(("OSI_USER_AUTOLOGIN".into(), get_str(store, Key::UserAutologin)));
        envs.push(("OSI_USER_PASSWORD".into(), get_str(store, Key::UserPassword)));
        envs.push(("OSI_FORMATS".into(), get_code(store, Key::Formats)));
        envs.push(("OSI_TIMEZONE".into(), get_str(store, Key::Timezone)));
        envs.push(("OSI_ADDITIONAL_SOFTWARE".into(), get_joined(store, Key::SoftwareChoices)));
        envs.push(("OSI_ADDITIONAL_FEATURES".into(), get_joined(store, Key::FeatureChoices)));
    }
    envs
}

fn get(store: &Store, key: Key) -> Option<Value> {
    let value = store.get_opt(key);
    if value.is_none() {
        warn!(
            "Required variable {key} not set, using empty string fallback. \
             Please report this error."
        );
    }
    value
}

/// Scalar rendering: booleans become `0`/`1`, everything else its text form.
fn get_str(store: &Store, key: Key) -> String {
    match get(store, key) {
        Some(Value::Bool(b)) => if b { "1" } else { "0" }.into(),
        Some(Value::Str(s)) => s,
        Some(Value::Int(i)) => i.to_string(),
        _ => String::new(),
    }
}

/// Pair values (code, display name) export only the code.
fn get_code(store: &Store, key: Key) -> String {
    match get(store, key) {
        Some(Value::Pair(code, _)) => code,
        _ => String::new(),
    }
}

fn get_joined(store: &Store, key: Key) -> String {
    match get(store, key) {
        Some(Value::List(items)) => items.join(" "),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_value(envs: &[(String, String)], name: &str) -> Option<String> {
        envs.iter().find(|(k, _)| k == name).map(|(_, v)| v.clone())
    }

    fn populated_store() -> Store {
        let store = Store::new();
        store.mark_initialized();
        store.set(Key::Locale, Value::Str("de_DE.UTF-8".into()));
        store.set(Key::KeyboardLayout, Value::Pair("de".into(), "German".into()));
        store.set(Key::DevicePath, Value::Str("/dev/vda".into()));
        store.set(Key::DeviceIsPartition, Value::Bool(false));
        store.set(Key::DeviceEfiPartition, Value::Str("/dev/vda1".into()));
        store.set(Key::UseEncryption, Value::Bool(true));
        store.set(Key::EncryptionPin, Value::Str("1234".into()));
        store.set(Key::UserName, Value::Str("Alice".into()));
        store.set(Key::UserAutologin, Value::Bool(true));
        store.set(Key::UserPassword, Value::Str("hunter2".into()));
        store.set(Key::Formats, Value::Pair("de_DE.UTF-8".into(), "Germany".into()));
        store.set(Key::Timezone, Value::Str("Europe/Berlin".into()));
        store.set(
            Key::SoftwareChoices,
            Value::List(vec!["libreoffice".into(), "gimp".into()]),
        );
        store.set(Key::FeatureChoices, Value::List(vec!["flatpak".into()]));
        store
    }

    #[test]
    fn test_prepare_gets_no_wizard_variables() {
        let store = populated_store();
        assert!(create_envs(&store, Stage::Prepare).is_empty());
    }

    #[test]
    fn test_install_envs() {
        let store = populated_store();
        let envs = create_envs(&store, Stage::Install);
        assert_eq!(envs.len(), 7);
        assert_eq!(env_value(&envs, "OSI_LOCALE").as_deref(), Some("de_DE.UTF-8"));
        assert_eq!(env_value(&envs, "OSI_KEYBOARD_LAYOUT").as_deref(), Some("de"));
        assert_eq!(env_value(&envs, "OSI_DEVICE_IS_PARTITION").as_deref(), Some("0"));
        assert_eq!(env_value(&envs, "OSI_USE_ENCRYPTION").as_deref(), Some("1"));
        // configure-only variables are absent
        assert_eq!(env_value(&envs, "OSI_USER_NAME"), None);
    }

    #[test]
    fn test_configure_envs_extend_install_envs() {
        let store = populated_store();
        let envs = create_envs(&store, Stage::Configure);
        assert_eq!(envs.len(), 14);
        assert_eq!(env_value(&envs, "OSI_DEVICE_PATH").as_deref(), Some("/dev/vda"));
        assert_eq!(env_value(&envs, "OSI_USER_AUTOLOGIN").as_deref(), Some("1"));
        assert_eq!(env_value(&envs, "OSI_FORMATS").as_deref(), Some("de_DE.UTF-8"));
        assert_eq!(
            env_value(&envs, "OSI_ADDITIONAL_SOFTWARE").as_deref(),
            Some("libreoffice gimp")
        );
        assert_eq!(env_value(&envs, "OSI_ADDITIONAL_FEATURES").as_deref(), Some("flatpak"));
    }

    #[test]
    fn test_missing_keys_become_empty_strings() {
        let store = Store::new();
        store.mark_initialized();
        store.steal(Key::Timezone);
        let envs = create_envs(&store, Stage::Configure);
        // locale was never set, timezone was removed; both degrade to ""
        assert_eq!(env_value(&envs, "OSI_LOCALE").as_deref(), Some(""));
        assert_eq!(env_value(&envs, "OSI_TIMEZONE").as_deref(), Some(""));
    }
}
