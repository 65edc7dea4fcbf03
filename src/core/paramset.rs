//! Parameter Sets

#![allow(dead_code)]

use crate::core::pbrt::{Float, Int};
use std::collections::HashMap;

/// Stores configuration parameters of different types in hashmaps.
#[derive(Clone, Default)]
pub struct ParamSet {
    pub bools: HashMap<String, bool>,
    pub ints: HashMap<String, Int>,
    pub floats: HashMap<String, Float>,
    pub strings: HashMap<String, String>,
}

/// Define a macro that can be used to generate a function for adding/replacing
/// a parameter set item.
macro_rules! paramset_add {
    ($func: ident, $t: ty, $paramset: ident) => {
        pub fn $func(&mut self, name: &str, value: $t) {
            self.$paramset.insert(String::from(name), value);
        }
    };
}

/// Define a macro that can be used to generate a function for finding a
/// parameter set item, falling back to a default.
macro_rules! paramset_find_one {
    ($func: ident, $t: ty, $paramset: ident) => {
        pub fn $func(&self, name: &str, default: $t) -> $t {
            match self.$paramset.get(name) {
                Some(value) => value.clone(),
                None => default,
            }
        }
    };
}

impl ParamSet {
    /// Returns a new empty `ParamSet`.
    pub fn new() -> Self {
        Self::default()
    }

    paramset_add!(add_bool, bool, bools);
    paramset_add!(add_int, Int, ints);
    paramset_add!(add_float, Float, floats);
    paramset_add!(add_string, String, strings);

    paramset_find_one!(find_one_bool, bool, bools);
    paramset_find_one!(find_one_int, Int, ints);
    paramset_find_one!(find_one_float, Float, floats);
    paramset_find_one!(find_one_string, String, strings);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_one_returns_default_when_missing() {
        let params = ParamSet::new();
        assert_eq!(params.find_one_int("sppPerPass", 4), 4);
        assert_eq!(params.find_one_string("nee", "never".to_owned()), "never");
    }

    #[test]
    fn add_then_find() {
        let mut params = ParamSet::new();
        params.add_float("budget", 16.0);
        params.add_bool("reweight", true);
        assert_eq!(params.find_one_float("budget", 300.0), 16.0);
        assert!(params.find_one_bool("reweight", false));
    }
}
