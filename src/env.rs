//! Process-wide key-value store. The runtime keeps two: one for
//! configuration values, one for the service name registry. Reads hand
//! back owned copies.

use std::collections::HashMap;

use crate::lock::SpinLock;

#[derive(Clone, Debug, PartialEq)]
enum Value {
    Int(i64),
    Str(String),
}

pub struct Env {
    map: SpinLock<HashMap<String, Value>>,
}

impl Env {
    pub fn new() -> Env {
        Env {
            map: SpinLock::new(HashMap::new()),
        }
    }

    pub fn set_int(&self, key: &str, val: i64) {
        self.map.lock().insert(key.to_string(), Value::Int(val));
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.map.lock().get(key) {
            Some(Value::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn set_str(&self, key: &str, val: &str) {
        self.map
            .lock()
            .insert(key.to_string(), Value::Str(val.to_string()));
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.map.lock().get(key) {
            Some(Value::Str(v)) => Some(v.clone()),
            _ => None,
        }
    }
}

impl Default for Env {
    fn default() -> Self {
        Env::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_round_trip() {
        let env = Env::new();
        env.set_str("main", "boot");
        env.set_int("thread", 4);
        assert_eq!(env.get_str("main").as_deref(), Some("boot"));
        assert_eq!(env.get_int("thread"), Some(4));
        assert_eq!(env.get_int("main"), None, "type-mismatched read misses");
        assert_eq!(env.get_str("missing"), None);
        env.set_str("main", "other");
        assert_eq!(env.get_str("main").as_deref(), Some("other"));
    }
}
