// Multicore Virtual Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Property providers and their fixed precedence chain.
//!
//! Every tunable of the platform is a dotted key such as `system.cpu1.clock`.
//! A [`PropertyStore`] consults its providers in order (command line,
//! environment, file, built-in default) and returns the first hit.

use crate::{ConfigError, ConfigResult};
use serde_yaml::Value;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Debug;
use std::path::Path;

pub trait PropertyProvider: Debug {
    fn name(&self) -> &'static str;
    fn lookup(&self, key: &str) -> Option<String>;

    /// Keys this provider knows about, used to report unconsumed properties.
    /// Providers that cannot enumerate (environment) return an empty list.
    fn keys(&self) -> Vec<String> {
        Vec::new()
    }
}

/// `-c key=value` assignments from the command line.
#[derive(Debug, Default, Clone)]
pub struct ArgProvider {
    values: BTreeMap<String, String>,
}

impl ArgProvider {
    pub fn from_assignments<I, S>(assignments: I) -> ConfigResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut values = BTreeMap::new();
        for a in assignments {
            let a = a.as_ref();
            let Some((key, value)) = a.split_once('=') else {
                return Err(ConfigError::MalformedAssignment(a.to_string()));
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(ConfigError::MalformedAssignment(a.to_string()));
            }
            values.insert(key.to_string(), value.trim().to_string());
        }
        Ok(Self { values })
    }
}

impl PropertyProvider for ArgProvider {
    fn name(&self) -> &'static str {
        "command line"
    }

    fn lookup(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }
}

/// Environment variables; `system.cpu0.clock` is looked up as `SYSTEM_CPU0_CLOCK`.
#[derive(Debug, Default, Clone)]
pub struct EnvProvider {
    vars: HashMap<String, String>,
}

impl EnvProvider {
    pub fn from_process() -> Self {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I: IntoIterator<Item = (String, String)>>(vars: I) -> Self {
        Self {
            vars: vars.into_iter().collect(),
        }
    }

    pub fn env_name(key: &str) -> String {
        key.replace('.', "_").to_ascii_uppercase()
    }
}

impl PropertyProvider for EnvProvider {
    fn name(&self) -> &'static str {
        "environment"
    }

    fn lookup(&self, key: &str) -> Option<String> {
        self.vars.get(&Self::env_name(key)).cloned()
    }
}

/// YAML configuration file. Nested mappings are flattened into dotted keys,
/// so `system: { cpu0: { clock: 50MHz } }` provides `system.cpu0.clock`.
#[derive(Debug, Default, Clone)]
pub struct FileProvider {
    values: BTreeMap<String, String>,
}

impl FileProvider {
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let root: Value = serde_yaml::from_str(&content).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!("Loaded configuration file {:?}", path);
        Ok(Self::from_value(&root))
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        let root: Value = serde_yaml::from_str(yaml)?;
        Ok(Self::from_value(&root))
    }

    fn from_value(root: &Value) -> Self {
        let mut values = BTreeMap::new();
        flatten("", root, &mut values);
        Self { values }
    }
}

fn scalar_to_string(v: &Value) -> Option<String> {
    match v {
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn flatten(prefix: &str, value: &Value, out: &mut BTreeMap<String, String>) {
    match value {
        Value::Mapping(map) => {
            for (k, v) in map {
                let Some(k) = scalar_to_string(k) else {
                    continue;
                };
                let key = if prefix.is_empty() {
                    k
                } else {
                    format!("{}.{}", prefix, k)
                };
                flatten(&key, v, out);
            }
        }
        Value::Sequence(items) => {
            let joined: Vec<String> = items.iter().filter_map(scalar_to_string).collect();
            out.insert(prefix.to_string(), joined.join(","));
        }
        Value::Null => {}
        Value::Tagged(tagged) => flatten(prefix, &tagged.value, out),
        scalar => {
            if let Some(s) = scalar_to_string(scalar) {
                out.insert(prefix.to_string(), s);
            }
        }
    }
}

impl PropertyProvider for FileProvider {
    fn name(&self) -> &'static str {
        "file"
    }

    fn lookup(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn keys(&self) -> Vec<String> {
        self.values.keys().cloned().collect()
    }
}

/// Explicit defaults supplied programmatically, consulted last.
#[derive(Debug, Default, Clone)]
pub struct DefaultProvider {
    values: BTreeMap<String, String>,
}

impl DefaultProvider {
    pub fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.to_string(), value.to_string());
    }
}

impl PropertyProvider for DefaultProvider {
    fn name(&self) -> &'static str {
        "default"
    }

    fn lookup(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Ordered provider chain: command line > environment > file > default.
#[derive(Debug, Default)]
pub struct PropertyStore {
    providers: Vec<Box<dyn PropertyProvider>>,
    consumed: RefCell<HashSet<String>>,
}

impl PropertyStore {
    pub fn new(
        args: ArgProvider,
        env: EnvProvider,
        file: Option<FileProvider>,
        defaults: DefaultProvider,
    ) -> Self {
        let mut providers: Vec<Box<dyn PropertyProvider>> = vec![Box::new(args), Box::new(env)];
        if let Some(file) = file {
            providers.push(Box::new(file));
        }
        providers.push(Box::new(defaults));
        Self {
            providers,
            consumed: RefCell::new(HashSet::new()),
        }
    }

    /// Store backed only by command-line style assignments, handy for tests.
    pub fn from_assignments<I, S>(assignments: I) -> ConfigResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self::new(
            ArgProvider::from_assignments(assignments)?,
            EnvProvider::default(),
            None,
            DefaultProvider::default(),
        ))
    }

    /// Returns the winning value and the provider it came from.
    pub fn lookup(&self, key: &str) -> Option<(String, &'static str)> {
        self.consumed.borrow_mut().insert(key.to_string());
        self.providers
            .iter()
            .find_map(|p| p.lookup(key).map(|v| (v, p.name())))
    }

    pub fn get_raw(&self, key: &str) -> Option<String> {
        self.lookup(key).map(|(v, _)| v)
    }

    /// Typed lookup falling back to `default` when no provider knows `key`.
    pub fn get_or<T, F>(&self, key: &str, default: T, parse: F) -> ConfigResult<T>
    where
        F: FnOnce(&str) -> Result<T, String>,
    {
        match self.lookup(key) {
            Some((raw, source)) => {
                tracing::trace!("property {} = '{}' (from {})", key, raw, source);
                parse(&raw).map_err(|reason| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: raw,
                    reason,
                })
            }
            None => Ok(default),
        }
    }

    pub fn get_opt<T, F>(&self, key: &str, parse: F) -> ConfigResult<Option<T>>
    where
        F: FnOnce(&str) -> Result<T, String>,
    {
        match self.lookup(key) {
            Some((raw, _)) => parse(&raw)
                .map(Some)
                .map_err(|reason| ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: raw,
                    reason,
                }),
            None => Ok(None),
        }
    }

    /// Keys offered by enumerable providers that no component ever asked for.
    pub fn unconsumed_keys(&self) -> Vec<String> {
        let consumed = self.consumed.borrow();
        let mut unused: Vec<String> = self
            .providers
            .iter()
            .flat_map(|p| p.keys())
            .filter(|k| !consumed.contains(k))
            .collect();
        unused.sort();
        unused.dedup();
        unused
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_beats_environment_and_file() {
        let args = ArgProvider::from_assignments(["system.nrcpu=4"]).unwrap();
        let env = EnvProvider::from_vars([
            ("SYSTEM_NRCPU".to_string(), "3".to_string()),
            ("SYSTEM_QUANTUM".to_string(), "10us".to_string()),
        ]);
        let file = FileProvider::from_yaml(
            "system:\n  nrcpu: 2\n  quantum: 100us\n  duration: 1ms\n",
        )
        .unwrap();
        let store = PropertyStore::new(args, env, Some(file), DefaultProvider::default());

        assert_eq!(
            store.lookup("system.nrcpu"),
            Some(("4".to_string(), "command line"))
        );
        assert_eq!(
            store.lookup("system.quantum"),
            Some(("10us".to_string(), "environment"))
        );
        assert_eq!(
            store.lookup("system.duration"),
            Some(("1ms".to_string(), "file"))
        );
        assert_eq!(store.lookup("system.clock"), None);
    }

    #[test]
    fn test_defaults_are_consulted_last() {
        let mut defaults = DefaultProvider::default();
        defaults.set("system.nrcpu", "8");
        let file = FileProvider::from_yaml("system.nrcpu: 2").unwrap();
        let store = PropertyStore::new(
            ArgProvider::default(),
            EnvProvider::default(),
            Some(file),
            defaults,
        );
        assert_eq!(store.get_raw("system.nrcpu").as_deref(), Some("2"));
    }

    #[test]
    fn test_yaml_flattening_of_nested_and_sequences() {
        let file = FileProvider::from_yaml(
            r#"
system:
  cpu1:
    irq_uart0: 7
    enable_data_dmi: false
  uart0:
    irq_cores: [0, 2]
"#,
        )
        .unwrap();
        assert_eq!(file.lookup("system.cpu1.irq_uart0").as_deref(), Some("7"));
        assert_eq!(
            file.lookup("system.cpu1.enable_data_dmi").as_deref(),
            Some("false")
        );
        assert_eq!(file.lookup("system.uart0.irq_cores").as_deref(), Some("0,2"));
    }

    #[test]
    fn test_malformed_assignment_is_rejected() {
        let err = ArgProvider::from_assignments(["system.nrcpu"]).unwrap_err();
        assert!(matches!(err, ConfigError::MalformedAssignment(_)));
    }

    #[test]
    fn test_env_name_mapping() {
        assert_eq!(EnvProvider::env_name("system.cpu0.clock"), "SYSTEM_CPU0_CLOCK");
    }

    #[test]
    fn test_unconsumed_keys_reports_typos() {
        let store =
            PropertyStore::from_assignments(["system.nrcpu=2", "system.nrcpus=3"]).unwrap();
        let _ = store.get_raw("system.nrcpu");
        assert_eq!(store.unconsumed_keys(), vec!["system.nrcpus".to_string()]);
    }
}
