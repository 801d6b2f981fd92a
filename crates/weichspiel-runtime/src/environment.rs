use std::ffi::OsString;

use serde::{ser::SerializeMap, Serialize, Serializer};

use crate::platform::PATH_LIST_SEPARATOR;

/// Variables whose values are separator-delimited search lists. Merging appends
/// to these instead of replacing them.
const PATH_LIKE: [&str; 3] = ["PATH", "LD_LIBRARY_PATH", "DYLD_LIBRARY_PATH"];

/// Ordered set of environment variables.
///
/// Key comparison follows the host: case-insensitive on Windows (`Path` and
/// `PATH` are the same variable there), exact elsewhere.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: Vec<(String, String)>,
}

fn same_key(a: &str, b: &str) -> bool {
    if cfg!(windows) {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}

pub fn is_path_like(key: &str) -> bool {
    PATH_LIKE.iter().any(|p| p.eq_ignore_ascii_case(key))
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current process environment. Non-UTF-8 entries are skipped.
    pub fn from_process() -> Self {
        let mut env = Self::new();
        for (k, v) in std::env::vars_os() {
            if let (Some(k), Some(v)) = (os_to_string(k), os_to_string(v)) {
                env.set(k, v);
            }
        }
        env
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| same_key(k, key))
            .map(|(_, v)| v.as_str())
    }

    /// Sets `key`, keeping its original position if it was already present.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.vars.iter_mut().find(|(k, _)| same_key(k, &key)) {
            Some(slot) => slot.1 = value,
            None => self.vars.push((key, value)),
        }
    }

    /// Merges one entry: path-like keys are concatenated, everything else is replaced.
    pub fn merge_entry(&mut self, key: &str, value: &str) {
        if is_path_like(key) {
            if let Some(existing) = self.get(key).filter(|v| !v.is_empty()) {
                let joined = format!("{existing}{PATH_LIST_SEPARATOR}{value}");
                self.set(key, joined);
                return;
            }
        }
        self.set(key, value);
    }

    pub fn merge(&mut self, other: &Environment) {
        for (k, v) in other.iter() {
            self.merge_entry(k, v);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.vars.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut env = Self::new();
        for (k, v) in iter {
            env.set(k, v);
        }
        env
    }
}

impl Serialize for Environment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.vars.len()))?;
        for (k, v) in &self.vars {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

fn os_to_string(s: OsString) -> Option<String> {
    s.into_string().ok()
}

/// Merges environments in order. Callers put the runtime's own environment
/// last so that its values win for every non path-like key.
pub fn aggregate<'a>(envs: impl IntoIterator<Item = &'a Environment>) -> Environment {
    aggregate_onto(Environment::new(), envs)
}

/// Like [`aggregate`], starting from `base` (usually the process environment).
pub fn aggregate_onto<'a>(
    mut base: Environment,
    envs: impl IntoIterator<Item = &'a Environment>,
) -> Environment {
    for env in envs {
        base.merge(env);
    }
    base
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Environment {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    #[test]
    fn path_like_keys_concatenate_and_others_last_wins() {
        let parts = [
            env(&[("PATH", "/a")]),
            env(&[("PATH", "/b")]),
            env(&[("FOO", "x")]),
            env(&[("FOO", "y")]),
        ];
        let merged = aggregate(parts.iter());
        assert_eq!(
            merged.get("PATH"),
            Some(format!("/a{PATH_LIST_SEPARATOR}/b").as_str())
        );
        assert_eq!(merged.get("FOO"), Some("y"));
        assert_eq!(merged.keys().collect::<Vec<_>>(), vec!["PATH", "FOO"]);
    }

    #[test]
    fn empty_path_value_is_replaced_not_prefixed() {
        let merged = aggregate([env(&[("LD_LIBRARY_PATH", "")]), env(&[("LD_LIBRARY_PATH", "/lib")])].iter());
        assert_eq!(merged.get("LD_LIBRARY_PATH"), Some("/lib"));
    }

    #[test]
    fn base_environment_keeps_user_search_paths_first() {
        let base = env(&[("DYLD_LIBRARY_PATH", "/opt/mine"), ("HOME", "/home/u")]);
        let media = env(&[
            ("DYLD_LIBRARY_PATH", "/Applications/VLC.app/Contents/MacOS"),
            ("VLC_PLUGIN_PATH", "/Applications/VLC.app/Contents/MacOS/plugins"),
        ]);
        let merged = aggregate_onto(base, [&media]);
        assert_eq!(
            merged.get("DYLD_LIBRARY_PATH"),
            Some(format!("/opt/mine{PATH_LIST_SEPARATOR}/Applications/VLC.app/Contents/MacOS").as_str())
        );
        assert_eq!(merged.get("HOME"), Some("/home/u"));
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn path_like_detection_ignores_case() {
        assert!(is_path_like("Path"));
        assert!(is_path_like("LD_LIBRARY_PATH"));
        assert!(!is_path_like("VLC_PLUGIN_PATH"));
    }

    #[test]
    fn serializes_as_json_object_in_order() {
        let e = env(&[("B", "2"), ("A", "1")]);
        assert_eq!(serde_json::to_string(&e).unwrap(), r#"{"B":"2","A":"1"}"#);
    }
}
