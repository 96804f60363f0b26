/*!
Flat parameter store for the simulator.

Purpose
- Every component is configured from string keys shaped like dotted paths
  (`pts.l1d$.num_sets`, `pts.mc.tRCD`, `pts.num_hthreads`). Components look
  their parameters up once at construction time and cache them as plain
  fields, so the store is not touched on the simulation fast path.
- Three typed views are provided (`u64`, `bool`, string), each with a
  caller-supplied default for missing keys.

Loading
- `Params::from_toml_str` / `from_toml_file` flatten a TOML table of keys
  into the store: nested tables extend the dotted prefix, leaves become
  entries in the matching typed map. Integers land in the u64 map, booleans
  in the bool map, strings in the string map.
- Tests and embedding code can also populate the store programmatically
  with `set_u64` / `set_bool` / `set_str`.
*/

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read parameter file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse parameter file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unsupported parameter value for key {0}")]
    BadValue(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Default, Clone)]
pub struct Params {
    uint64: HashMap<String, u64>,
    boolean: HashMap<String, bool>,
    string: HashMap<String, String>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = text.parse()?;
        let mut params = Self::new();
        params.flatten_table(&table, "")?;
        Ok(params)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    fn flatten_table(&mut self, table: &toml::Table, prefix: &str) -> Result<(), ConfigError> {
        for (key, value) in table {
            let full = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };
            match value {
                toml::Value::Table(inner) => self.flatten_table(inner, &full)?,
                toml::Value::Integer(v) => {
                    self.uint64.insert(full, *v as u64);
                }
                toml::Value::Boolean(v) => {
                    self.boolean.insert(full, *v);
                }
                toml::Value::String(v) => {
                    self.string.insert(full, v.clone());
                }
                _ => return Err(ConfigError::BadValue(full)),
            }
        }
        Ok(())
    }

    pub fn set_u64(&mut self, key: &str, value: u64) {
        self.uint64.insert(key.to_string(), value);
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.boolean.insert(key.to_string(), value);
    }

    pub fn set_str(&mut self, key: &str, value: &str) {
        self.string.insert(key.to_string(), value.to_string());
    }

    pub fn get_u64(&self, key: &str, def: u64) -> u64 {
        self.uint64.get(key).copied().unwrap_or(def)
    }

    pub fn get_bool(&self, key: &str, def: bool) -> bool {
        self.boolean.get(key).copied().unwrap_or(def)
    }

    /// Missing string keys read as "" so that equality tests against
    /// concrete values ("xbar", "open", ...) fall through to the default arm.
    pub fn get_str(&self, key: &str) -> &str {
        self.string.get(key).map(String::as_str).unwrap_or("")
    }
}

/// Typed parameter access under a fixed component prefix (`pts.l2$.` etc.).
/// Construction-time convenience; components copy values out into fields.
#[derive(Clone, Copy)]
pub struct Scoped<'a> {
    params: &'a Params,
    prefix: &'a str,
}

impl<'a> Scoped<'a> {
    pub fn new(params: &'a Params, prefix: &'a str) -> Self {
        Self { params, prefix }
    }

    pub fn u64(&self, key: &str, def: u64) -> u64 {
        self.params.get_u64(&format!("{}{}", self.prefix, key), def)
    }

    pub fn bool(&self, key: &str, def: bool) -> bool {
        self.params.get_bool(&format!("{}{}", self.prefix, key), def)
    }

    pub fn str(&self, key: &str) -> &'a str {
        // Leaking through a temporary is avoided by looking up directly.
        let full = format!("{}{}", self.prefix, key);
        match self.params.string.get(&full) {
            Some(v) => v.as_str(),
            None => "",
        }
    }
}

/// Floor of log2; sizes fed to this are powers of two in practice.
pub fn log2(num: u64) -> u32 {
    debug_assert!(num > 0);
    63 - num.leading_zeros()
}

/// Round `x` up to the next multiple of `y`.
#[inline]
pub fn ceil_by(x: u64, y: u64) -> u64 {
    ((x + y - 1) / y) * y
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_typed_views() {
        let mut p = Params::new();
        p.set_u64("pts.l1d$.num_sets", 128);
        p.set_bool("pts.l1d$.use_prefetch", true);
        p.set_str("pts.noc_type", "mesh");

        assert_eq!(p.get_u64("pts.l1d$.num_sets", 64), 128);
        assert_eq!(p.get_u64("pts.l1i$.num_sets", 64), 64);
        assert!(p.get_bool("pts.l1d$.use_prefetch", false));
        assert!(!p.get_bool("pts.l1i$.use_prefetch", false));
        assert_eq!(p.get_str("pts.noc_type"), "mesh");
        assert_eq!(p.get_str("pts.mc.scheduling_policy"), "");
    }

    #[test]
    fn toml_tables_flatten_to_dotted_keys() {
        let text = r#"
            [pts]
            num_hthreads = 4
            noc_type = "xbar"

            [pts."l2$"]
            num_sets = 512
            always_hit = false

            [pts.mc]
            tRCD = 10
            scheduling_policy = "open"
        "#;
        let p = Params::from_toml_str(text).unwrap();
        assert_eq!(p.get_u64("pts.num_hthreads", 0), 4);
        assert_eq!(p.get_u64("pts.l2$.num_sets", 0), 512);
        assert_eq!(p.get_u64("pts.mc.tRCD", 0), 10);
        assert_eq!(p.get_str("pts.mc.scheduling_policy"), "open");
        assert!(!p.get_bool("pts.l2$.always_hit", true));
    }

    #[test]
    fn scoped_lookup_applies_prefix() {
        let mut p = Params::new();
        p.set_u64("pts.dir.num_ways", 2);
        let scoped = Scoped::new(&p, "pts.dir.");
        assert_eq!(scoped.u64("num_ways", 4), 2);
        assert_eq!(scoped.u64("num_sets", 16), 16);
    }

    #[test]
    fn ceil_by_rounds_up_to_multiple() {
        assert_eq!(ceil_by(0, 10), 0);
        assert_eq!(ceil_by(1, 10), 10);
        assert_eq!(ceil_by(10, 10), 10);
        assert_eq!(ceil_by(11, 10), 20);
    }
}
